//! Local similarity search over knowledge base passages
//!
//! Every knowledge base keeps its passages in a fjall keyspace at
//! `vectorstore/<collection_id>` and their embeddings in a usearch cosine
//! index at `vectorstore/<collection_id>.usearch`. A knowledge base that was
//! never ingested has neither and searches to an empty result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::UsearchWrapper;
use crate::ai::Embedder;
use crate::core::{EngineCache, FjallWrapper, KnowledgeBase, KnowledgeBaseStore};
use crate::error::{KbError, KbResult};

/// Longest passage body produced by ingestion, in characters
pub const MAX_PASSAGE_CHARS: usize = 800;

const EMBED_BATCH: usize = 64;
const META_DIMENSIONS: &[u8] = b"meta:dimensions";
const META_NEXT_ID: &[u8] = b"meta:next_id";
const PASSAGE_PREFIX: &[u8] = b"passage:";

/// A passage returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub text: String,
    pub source: Option<String>,
    /// Similarity in `[0, 1]` for normalised cosine space, higher is closer
    pub score: f32,
}

/// Nearest-neighbour lookup over one knowledge base
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Up to `k` passages closest to `query`, in any order
    async fn search(&self, kb: &KnowledgeBase, query: &str, k: usize) -> KbResult<Vec<ScoredPassage>>;
}

/// A source document to ingest
#[derive(Debug, Clone)]
pub struct Document {
    /// File name or other label, stored as the passage header
    pub source: String,
    pub text: String,
}

impl Document {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPassage {
    text: String,
    source: String,
}

fn passage_key(id: u64) -> Vec<u8> {
    let mut key = PASSAGE_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn read_u64(db: &FjallWrapper, key: &[u8]) -> anyhow::Result<Option<u64>> {
    match db.get(key)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("corrupt metadata entry {}", String::from_utf8_lossy(key)))?;
            Ok(Some(u64::from_be_bytes(raw)))
        }
        None => Ok(None),
    }
}

/// Open handles of one knowledge base collection
struct Collection {
    passages: FjallWrapper,
    index: Mutex<Option<UsearchWrapper>>,
    index_path: PathBuf,
}

impl Collection {
    fn open(dir: &Path, index_path: PathBuf) -> anyhow::Result<Self> {
        let passages = FjallWrapper::new(dir)?;
        let index = match read_u64(&passages, META_DIMENSIONS)? {
            Some(dimensions) if index_path.exists() => {
                Some(UsearchWrapper::load(&index_path, dimensions as usize)?)
            }
            _ => None,
        };
        Ok(Self {
            passages,
            index: Mutex::new(index),
            index_path,
        })
    }

    fn search(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<ScoredPassage>> {
        let guard = self.index.lock().map_err(|_| anyhow!("index lock poisoned"))?;
        let Some(index) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        if index.size() == 0 {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for (id, distance) in index.search(vector, k)? {
            let Some(bytes) = self.passages.get(&passage_key(id))? else {
                tracing::warn!(id, "index entry without a stored passage");
                continue;
            };
            let stored: StoredPassage =
                serde_json::from_slice(&bytes).context("Failed to decode stored passage")?;
            results.push(ScoredPassage {
                text: stored.text,
                source: Some(stored.source),
                score: 1.0 - distance,
            });
        }
        Ok(results)
    }

    fn insert(&self, passages: Vec<StoredPassage>, vectors: Vec<Vec<f32>>) -> anyhow::Result<()> {
        let Some(dimensions) = vectors.first().map(Vec::len) else {
            return Ok(());
        };
        let mut guard = self.index.lock().map_err(|_| anyhow!("index lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(UsearchWrapper::new(dimensions)?);
        }
        let index = guard.as_ref().ok_or_else(|| anyhow!("index missing after creation"))?;

        let mut next_id = read_u64(&self.passages, META_NEXT_ID)?.unwrap_or(0);
        let mut batch = Vec::with_capacity(passages.len() + 2);
        for (passage, vector) in passages.into_iter().zip(vectors) {
            index.add(next_id, &vector)?;
            batch.push((passage_key(next_id), serde_json::to_vec(&passage)?));
            next_id += 1;
        }
        batch.push((META_NEXT_ID.to_vec(), next_id.to_be_bytes().to_vec()));
        batch.push((META_DIMENSIONS.to_vec(), (dimensions as u64).to_be_bytes().to_vec()));

        self.passages.batch_put(batch)?;
        index.save(&self.index_path)?;
        self.passages.flush()
    }
}

/// Similarity search engine backed by fjall and usearch.
///
/// Disk work (opening keyspaces, index queries, writes) runs on the blocking
/// pool.
pub struct LocalVectorStore {
    embedder: Arc<dyn Embedder>,
    collections: Mutex<HashMap<PathBuf, Arc<Collection>>>,
    opening: tokio::sync::Mutex<()>,
}

impl LocalVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            collections: Mutex::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of collections with open handles
    pub fn open_collections(&self) -> usize {
        self.collections.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, dir: &Path) -> KbResult<Option<Arc<Collection>>> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| KbError::Storage(anyhow!("collection cache lock poisoned")))?;
        Ok(collections.get(dir).cloned())
    }

    async fn collection(&self, kb: &KnowledgeBase, create: bool) -> KbResult<Option<Arc<Collection>>> {
        let dir = kb.vectorstore_dir().join(kb.collection_id());
        if let Some(collection) = self.cached(&dir)? {
            return Ok(Some(collection));
        }

        // One open at a time, so a keyspace is never opened twice.
        let _opening = self.opening.lock().await;
        if let Some(collection) = self.cached(&dir)? {
            return Ok(Some(collection));
        }
        if !create && !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(None);
        }

        let index_path = kb
            .vectorstore_dir()
            .join(format!("{}.usearch", kb.collection_id()));
        let open_dir = dir.clone();
        let collection = tokio::task::spawn_blocking(move || Collection::open(&open_dir, index_path))
            .await
            .map_err(|e| KbError::Storage(anyhow!("open task failed: {}", e)))??;
        let collection = Arc::new(collection);
        tracing::debug!(collection = kb.collection_id(), "opened collection");

        self.collections
            .lock()
            .map_err(|_| KbError::Storage(anyhow!("collection cache lock poisoned")))?
            .insert(dir, collection.clone());
        Ok(Some(collection))
    }

    async fn embed_all(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            let embedded = self.embedder.embed(batch).await?;
            if embedded.len() != batch.len() {
                return Err(KbError::Gateway(format!(
                    "embedder returned {} vectors for {} inputs",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Chunk, embed and index documents into a knowledge base.
    ///
    /// Creates the knowledge base when needed and holds the store's shared
    /// lock, so ingestion never overlaps a purge. Returns the number of
    /// passages indexed.
    #[tracing::instrument(skip(self, store, documents), fields(documents = documents.len()))]
    pub async fn add_documents(
        &self,
        store: &KnowledgeBaseStore,
        kb_name: &str,
        documents: &[Document],
    ) -> KbResult<usize> {
        let _guard = store.read_guard().await;
        let kb = store.create(kb_name)?;

        let passages: Vec<StoredPassage> = documents
            .iter()
            .flat_map(|doc| {
                split_passages(&doc.text, MAX_PASSAGE_CHARS)
                    .into_iter()
                    .map(|chunk| StoredPassage {
                        text: format!("{}\n\n{}", doc.source, chunk),
                        source: doc.source.clone(),
                    })
            })
            .collect();
        if passages.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = self.embed_all(&texts).await?;
        let count = passages.len();

        let collection = self
            .collection(&kb, true)
            .await?
            .ok_or_else(|| KbError::Storage(anyhow!("collection for '{}' unavailable", kb_name)))?;
        tokio::task::spawn_blocking(move || collection.insert(passages, vectors))
            .await
            .map_err(|e| KbError::Storage(anyhow!("index task failed: {}", e)))??;
        tracing::info!(kb = kb_name, passages = count, "indexed passages");
        Ok(count)
    }
}

impl EngineCache for LocalVectorStore {
    fn clear_cache(&self) -> anyhow::Result<()> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("collection cache lock poisoned"))?;
        let dropped = collections.len();
        collections.clear();
        tracing::debug!(dropped, "cleared collection cache");
        Ok(())
    }
}

#[async_trait]
impl SimilaritySearch for LocalVectorStore {
    async fn search(&self, kb: &KnowledgeBase, query: &str, k: usize) -> KbResult<Vec<ScoredPassage>> {
        let Some(collection) = self.collection(kb, false).await? else {
            return Ok(Vec::new());
        };
        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| KbError::Gateway("embedder returned no vector".to_string()))?;
        let passages = tokio::task::spawn_blocking(move || collection.search(&vector, k))
            .await
            .map_err(|e| KbError::Storage(anyhow!("search task failed: {}", e)))??;
        Ok(passages)
    }
}

/// Split text into paragraph chunks of at most `max_chars` characters.
///
/// Paragraphs are separated by blank lines; consecutive short paragraphs are
/// packed together and overlong ones are cut.
pub fn split_passages(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let normalized = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in normalized.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for piece in cut(paragraph, max_chars) {
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + 2 + piece_len > max_chars {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push_str("\n\n");
                current_len += 2;
            }
            current.push_str(piece);
            current_len += piece_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn cut(paragraph: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while rest.chars().count() > max_chars {
        let split_at = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(split_at);
        pieces.push(head.trim_end());
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_packs_short_paragraphs() {
        let chunks = split_passages("alpha\n\nbeta\r\n\r\ngamma", 800);
        assert_eq!(chunks, vec!["alpha\n\nbeta\n\ngamma".to_string()]);
    }

    #[test]
    fn test_split_respects_limit() {
        let text = format!("{}\n\n{}", "a".repeat(10), "b".repeat(25));
        let chunks = split_passages(&text, 12);
        assert_eq!(chunks[0], "a".repeat(10));
        assert!(chunks.iter().all(|c| c.chars().count() <= 12));
        assert_eq!(chunks.concat().matches('b').count(), 25);
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let chunks = split_passages(&"客".repeat(5), 2);
        assert_eq!(chunks, vec!["客客", "客客", "客"]);
    }

    #[test]
    fn test_split_empty() {
        assert!(split_passages("\n\n  \n\n", 800).is_empty());
    }

    #[cfg(feature = "vector")]
    mod engine {
        use super::super::*;
        use tempfile::tempdir;

        /// Letter histogram embedding: texts sharing letters end up close
        struct LetterEmbedder;

        #[async_trait]
        impl Embedder for LetterEmbedder {
            async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
                Ok(texts
                    .iter()
                    .map(|text| {
                        let mut v = vec![0.01f32; 26];
                        for c in text.chars().filter(|c| c.is_ascii_lowercase()) {
                            v[(c as u8 - b'a') as usize] += 1.0;
                        }
                        v
                    })
                    .collect())
            }
        }

        #[tokio::test]
        async fn test_search_before_ingestion_is_empty() {
            let dir = tempdir().unwrap();
            let store = KnowledgeBaseStore::new(dir.path());
            store.create("empty").unwrap();
            let engine = LocalVectorStore::new(Arc::new(LetterEmbedder));

            let kb = store.knowledge_base("empty").unwrap();
            assert!(engine.search(&kb, "anything", 3).await.unwrap().is_empty());
            assert_eq!(engine.open_collections(), 0);
        }

        #[tokio::test]
        async fn test_ingest_and_search() {
            let dir = tempdir().unwrap();
            let store = KnowledgeBaseStore::new(dir.path());
            let engine = LocalVectorStore::new(Arc::new(LetterEmbedder));

            let docs = vec![
                Document::new("x", "aaaa aaaa aaaa"),
                Document::new("x", "zzzz zzzz zzzz"),
            ];
            let indexed = engine.add_documents(&store, "letters", &docs).await.unwrap();
            assert_eq!(indexed, 2);

            let kb = store.knowledge_base("letters").unwrap();
            let mut hits = engine.search(&kb, "aaa", 2).await.unwrap();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            assert_eq!(hits[0].text, "x\n\naaaa aaaa aaaa");
            assert_eq!(hits[0].source.as_deref(), Some("x"));
            assert!(hits[0].score > 0.9);
            assert!(hits[1].score < hits[0].score);

            // Handles reopen from disk after the cache is dropped
            engine.clear_cache().unwrap();
            assert_eq!(engine.open_collections(), 0);
            let hits = engine.search(&kb, "zzz", 1).await.unwrap();
            assert_eq!(hits[0].text, "x\n\nzzzz zzzz zzzz");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_concurrent_searches_share_one_collection() {
            let dir = tempdir().unwrap();
            let store = KnowledgeBaseStore::new(dir.path());
            let engine = Arc::new(LocalVectorStore::new(Arc::new(LetterEmbedder)));
            let docs = vec![Document::new("x", "aaaa aaaa aaaa")];
            engine.add_documents(&store, "letters", &docs).await.unwrap();
            engine.clear_cache().unwrap();

            let kb = store.knowledge_base("letters").unwrap();
            let searches = (0..8).map(|_| {
                let engine = engine.clone();
                let kb = kb.clone();
                tokio::spawn(async move { engine.search(&kb, "aaa", 1).await })
            });
            for result in futures::future::join_all(searches).await {
                let hits = result.unwrap().unwrap();
                assert_eq!(hits[0].text, "x\n\naaaa aaaa aaaa");
            }
            assert_eq!(engine.open_collections(), 1);
        }
    }
}
