//! Error types for kbchat operations

use thiserror::Error;

/// Main error type for kbchat operations
#[derive(Error, Debug)]
pub enum KbError {
    /// Missing credential or invalid setting; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The model asked for a tool that is not bound to the turn
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    /// A tool ran but its backing search failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Some knowledge base directories survived every purge attempt
    #[error("Purge incomplete: removed {removed} of {requested} knowledge bases")]
    PurgeIncomplete { requested: usize, removed: usize },

    /// The model call failed (network, auth, malformed response)
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// The caller cancelled the turn before the current step finished
    #[error("Turn cancelled")]
    Cancelled,

    /// An append would break the call/result pairing of the conversation
    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        KbError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for KbError {
    fn from(err: reqwest::Error) -> Self {
        KbError::Gateway(err.to_string())
    }
}

impl KbError {
    /// Errors a turn recovers from by reporting them to the model as a tool result
    pub fn is_tool_recoverable(&self) -> bool {
        matches!(
            self,
            KbError::UnknownTool(_) | KbError::ToolExecution { .. } | KbError::InvalidInput(_)
        )
    }
}

/// Result type alias for kbchat operations
pub type KbResult<T> = Result<T, KbError>;
