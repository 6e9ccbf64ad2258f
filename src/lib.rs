//! kbchat: a knowledge base chat agent.
//!
//! This library provides:
//! - Identifier sanitization for knowledge base names
//! - A knowledge base store on disk with a fault tolerant purge
//! - Per knowledge base retrieval tools over a local vector engine (fjall + usearch)
//! - An OpenAI-compatible model gateway with streaming and tool calls
//! - A turn orchestrator that alternates model reasoning and tool execution,
//!   checkpointing the conversation after every step
//!
//! # Example
//!
//! ```rust,ignore
//! use kbchat::{Config, KbChat};
//! use tokio_util::sync::CancellationToken;
//!
//! let chat = KbChat::new(Config::default())?;
//! let agent = chat.orchestrator(None)?;
//! let outcome = agent.run_turn("default", "What is the refund policy?", &CancellationToken::new(), None).await?;
//! println!("{}", outcome.answer);
//! ```

pub mod agent;
pub mod ai;
pub mod cli;
pub mod core;
pub mod error;
pub mod tools;
pub mod vector;

pub use crate::agent::{Orchestrator, TurnEvent, TurnOutcome, TurnState};
pub use crate::ai::{Embedder, GatewaySettings, ModelGateway, OpenAiClient};
pub use crate::core::{FjallWrapper, KnowledgeBase, KnowledgeBaseStore, PurgeReport, RetryPolicy};
pub use crate::error::{KbError, KbResult};
pub use crate::tools::{RetrievalSettings, RetrievalToolFactory, ToolDescriptor, ToolSet};
pub use crate::vector::{Document, LocalVectorStore, UsearchWrapper};

use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{CheckpointStore, FjallCheckpointStore, DEFAULT_MAX_TOOL_ROUNDS};

/// Configuration for a kbchat instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Root holding one directory per knowledge base
    pub kb_root: PathBuf,
    /// Where conversation checkpoints live
    pub data_dir: PathBuf,
    pub gateway: GatewaySettings,
    pub retrieval: RetrievalSettings,
    pub purge: RetryPolicy,
    pub max_tool_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kb_root: PathBuf::from("./knowledge_base"),
            data_dir: PathBuf::from("./data"),
            gateway: GatewaySettings::default(),
            retrieval: RetrievalSettings::default(),
            purge: RetryPolicy::default(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

/// Embedded kbchat interface
///
/// Wires the knowledge base store, the local vector engine, the checkpoint
/// store and the model gateway together from one [`Config`].
pub struct KbChat {
    config: Config,
    store: Arc<KnowledgeBaseStore>,
    engine: Arc<LocalVectorStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    gateway: Arc<dyn ModelGateway>,
}

impl KbChat {
    /// Create an instance talking to the configured OpenAI-compatible provider.
    ///
    /// Fails with [`KbError::Configuration`] when no API key is set.
    pub fn new(config: Config) -> KbResult<Self> {
        let client = Arc::new(OpenAiClient::new(config.gateway.clone())?);
        Self::with_components(config, client.clone(), client)
    }

    /// Create an instance with a custom gateway and embedder
    pub fn with_components(
        config: Config,
        gateway: Arc<dyn ModelGateway>,
        embedder: Arc<dyn Embedder>,
    ) -> KbResult<Self> {
        let engine = Arc::new(LocalVectorStore::new(embedder));
        let store = KnowledgeBaseStore::new(config.kb_root.clone())
            .with_retry_policy(config.purge)
            .with_engine_cache(engine.clone());
        let checkpoints = FjallCheckpointStore::open(config.data_dir.join("checkpoints"))?;

        Ok(Self {
            config,
            store: Arc::new(store),
            engine,
            checkpoints: Arc::new(checkpoints),
            gateway,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<KnowledgeBaseStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<LocalVectorStore> {
        &self.engine
    }

    /// Ingest documents into a knowledge base, creating it when needed
    pub async fn add_documents(&self, kb_name: &str, documents: &[Document]) -> KbResult<usize> {
        self.engine.add_documents(&self.store, kb_name, documents).await
    }

    /// Build an orchestrator bound to `kb_names`, or to every knowledge base when `None`
    pub fn orchestrator(&self, kb_names: Option<&[String]>) -> KbResult<Orchestrator> {
        let names = match kb_names {
            Some(names) => names.to_vec(),
            None => self.store.list()?,
        };
        let factory = RetrievalToolFactory::new(self.store.clone(), self.engine.clone())
            .with_settings(self.config.retrieval);
        let tools = factory.create_all(&names)?;
        tracing::info!(tools = tools.len(), "bound knowledge base tools");

        Ok(Orchestrator::new(self.gateway.clone(), tools, self.checkpoints.clone())
            .with_max_tool_rounds(self.config.max_tool_rounds))
    }
}
