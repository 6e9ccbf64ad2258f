//! Model gateway abstraction
//!
//! The orchestrator talks to the language model only through
//! [`ModelGateway`]: it hands over the conversation so far and the bound tool
//! specs, and gets back either plain text or a batch of tool-call requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::agent::types::{Message, ToolCallRequest};
use crate::error::{KbError, KbResult};
use crate::tools::ToolSpec;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// A fully assembled model response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Language model seam used by the orchestrator
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Invoke the model with the full history and the bound tools.
    ///
    /// When `tokens` is given, content deltas are forwarded as they arrive;
    /// the returned reply is always the complete message.
    async fn invoke(
        &self,
        history: &[Message],
        tools: &[ToolSpec],
        tokens: Option<&UnboundedSender<String>>,
    ) -> KbResult<AssistantReply>;
}

/// Connection settings for an OpenAI-compatible provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub stream: bool,
    pub system_prompt: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            stream: true,
            system_prompt: None,
        }
    }
}

impl GatewaySettings {
    /// Reject settings the provider can never accept
    pub fn validate(&self) -> KbResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(KbError::Configuration(
                "OPENAI_API_KEY is not set; export it or pass --api-key".to_string(),
            ));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(KbError::Configuration(format!(
                "base url '{}' is not an http(s) url",
                self.base_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(KbError::Configuration("model name is empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(KbError::Configuration(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }
}
