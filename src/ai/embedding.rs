use async_trait::async_trait;

use crate::error::KbResult;

/// Turns texts into embedding vectors, one per input, in input order
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>>;
}

#[cfg(feature = "embedding")]
pub use local::FastEmbedder;

#[cfg(feature = "embedding")]
mod local {
    use super::*;
    use anyhow::{anyhow, Result};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Arc;

    use crate::error::KbError;

    /// Local embedder on top of fastembed
    #[derive(Clone)]
    pub struct FastEmbedder {
        model: Arc<TextEmbedding>,
    }

    impl FastEmbedder {
        /// Load the default fastembed model
        pub fn new() -> Result<Self> {
            Self::with_options(InitOptions::default())
        }

        pub fn with_options(options: InitOptions) -> Result<Self> {
            let model = TextEmbedding::try_new(options)
                .map_err(|e| anyhow!("Failed to create TextEmbedding: {}", e))?;
            Ok(Self {
                model: Arc::new(model),
            })
        }

        pub fn with_model(model: EmbeddingModel) -> Result<Self> {
            let mut options = InitOptions::default();
            options.model_name = model;
            Self::with_options(options)
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
            let model = self.model.clone();
            let texts = texts.to_vec();
            tokio::task::spawn_blocking(move || model.embed(texts, None))
                .await
                .map_err(|e| KbError::Storage(anyhow!("embedding task failed: {}", e)))?
                .map_err(|e| KbError::Storage(anyhow!("Failed to generate embeddings: {}", e)))
        }
    }
}
