//! On-disk knowledge base root
//!
//! The root holds one subdirectory per knowledge base, named after the
//! human-readable knowledge base name. Each subdirectory contains a
//! `vectorstore` directory owned by the similarity-search engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use super::fs::{force_remove_dir, FileSystem, RealFs, RetryPolicy};
use super::naming::to_storage_id;
use crate::error::{KbError, KbResult};

/// Name of the engine-owned directory inside every knowledge base
pub const VECTORSTORE_DIR: &str = "vectorstore";

/// A resolved knowledge base: its name, derived collection id and location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBase {
    name: String,
    collection_id: String,
    dir: PathBuf,
}

impl KnowledgeBase {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage collection id used by the vector engine
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vectorstore_dir(&self) -> PathBuf {
        self.dir.join(VECTORSTORE_DIR)
    }
}

/// Outcome of [`KnowledgeBaseStore::purge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeReport {
    /// Knowledge base directories found under the root
    pub requested: usize,
    /// Knowledge base directories actually removed
    pub removed: usize,
}

impl PurgeReport {
    pub fn is_complete(&self) -> bool {
        self.removed == self.requested
    }

    /// Turn a partial purge into [`KbError::PurgeIncomplete`]
    pub fn into_result(self) -> KbResult<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(KbError::PurgeIncomplete {
                requested: self.requested,
                removed: self.removed,
            })
        }
    }
}

/// Something that keeps knowledge base files open and can let go of them.
///
/// The store drops every registered cache before a purge so open handles do
/// not keep directories alive.
pub trait EngineCache: Send + Sync {
    fn clear_cache(&self) -> anyhow::Result<()>;
}

/// Knowledge base root directory with list / create / purge operations
pub struct KnowledgeBaseStore {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    retry: RetryPolicy,
    gate: Arc<RwLock<()>>,
    caches: Vec<Arc<dyn EngineCache>>,
}

impl KnowledgeBaseStore {
    /// Create a store over `root` on the real filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_fs(root, Arc::new(RealFs))
    }

    pub fn with_fs(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
            retry: RetryPolicy::default(),
            gate: Arc::new(RwLock::new(())),
            caches: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a cache to invalidate before every purge
    pub fn with_engine_cache(mut self, cache: Arc<dyn EngineCache>) -> Self {
        self.caches.push(cache);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a knowledge base handle without touching the disk
    pub fn knowledge_base(&self, name: &str) -> KbResult<KnowledgeBase> {
        validate_name(name)?;
        Ok(KnowledgeBase {
            name: name.to_string(),
            collection_id: to_storage_id(name),
            dir: self.root.join(name),
        })
    }

    /// Names of the knowledge bases under the root, sorted.
    ///
    /// Creates the root when it does not exist yet.
    pub fn list(&self) -> KbResult<Vec<String>> {
        if !self.fs.is_dir(&self.root) {
            self.fs.create_dir_all(&self.root)?;
        }
        let mut names: Vec<String> = self
            .fs
            .read_dir(&self.root)?
            .into_iter()
            .filter(|path| self.fs.is_dir(path))
            .filter_map(|path| match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => Some(name.to_string()),
                None => {
                    tracing::warn!(path = %path.display(), "skipping knowledge base with a non UTF-8 name");
                    None
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Create a knowledge base directory (idempotent)
    pub fn create(&self, name: &str) -> KbResult<KnowledgeBase> {
        let kb = self.knowledge_base(name)?;
        self.fs.create_dir_all(&kb.vectorstore_dir())?;
        tracing::info!(name, collection = kb.collection_id(), "created knowledge base");
        Ok(kb)
    }

    /// Shared access to the root; held by tool executions and ingestion
    pub async fn read_guard(&self) -> OwnedRwLockReadGuard<()> {
        self.gate.clone().read_owned().await
    }

    /// Delete every knowledge base and stray file, then recreate an empty root.
    ///
    /// Holds the root exclusively for the whole operation. Directories that
    /// resist deletion are tolerated and show up as `removed < requested`.
    pub async fn purge(&self) -> KbResult<PurgeReport> {
        let guard = self.gate.clone().write_owned().await;
        self.invalidate_caches();

        let fs = self.fs.clone();
        let root = self.root.clone();
        let retry = self.retry;
        let report = tokio::task::spawn_blocking(move || {
            let report = purge_root(fs.as_ref(), &root, retry);
            drop(guard);
            report
        })
        .await
        .map_err(|e| KbError::Storage(anyhow!("purge task failed: {}", e)))??;

        if report.is_complete() {
            tracing::info!(removed = report.removed, "purged knowledge bases");
        } else {
            tracing::warn!(
                requested = report.requested,
                removed = report.removed,
                "purge left knowledge bases behind"
            );
        }
        Ok(report)
    }

    fn invalidate_caches(&self) {
        for cache in &self.caches {
            if let Err(e) = cache.clear_cache() {
                tracing::warn!(error = %e, "failed to clear engine cache before purge");
            }
        }
    }
}

/// The purge algorithm, independent of locking.
///
/// Only directories count towards the report; stray files directly under the
/// root are deleted individually. The root is always recreated, even when
/// some children could not be removed.
pub fn purge_root(fs: &dyn FileSystem, root: &Path, retry: RetryPolicy) -> KbResult<PurgeReport> {
    let mut report = PurgeReport::default();

    if fs.exists(root) {
        let children = fs.read_dir(root).unwrap_or_else(|e| {
            tracing::warn!(root = %root.display(), error = %e, "could not list knowledge base root");
            Vec::new()
        });
        for child in children {
            if fs.is_dir(&child) {
                report.requested += 1;
                if force_remove_dir(fs, &child, retry) {
                    report.removed += 1;
                }
            } else if let Err(e) = fs.remove_file(&child) {
                tracing::debug!(path = %child.display(), error = %e, "could not remove stray file");
            }
        }
        force_remove_dir(fs, root, retry);
    }

    fs.create_dir_all(root)?;
    Ok(report)
}

fn validate_name(name: &str) -> KbResult<()> {
    if name.is_empty() {
        return Err(KbError::InvalidInput("knowledge base name is empty".to_string()));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(KbError::InvalidInput(format!(
            "knowledge base name '{}' is not a single directory name",
            name
        )));
    }
    Ok(())
}
