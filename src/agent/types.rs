//! Core types for the agent module

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KbError, KbResult};

/// Unique identifier for a conversation
pub type ConversationId = String;

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Unique within the turn; tool results refer back to it
    pub id: String,
    pub tool_name: String,
    /// Structured arguments, expected to match the tool's input schema
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// User message
    User { content: String },
    /// Assistant/AI response, possibly requesting tool calls
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    /// Tool/function call result
    Tool {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::User { content }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Tool calls requested by an assistant message (empty for other roles)
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Where a conversation stands in the turn state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    AwaitingUserInput,
    ModelThinking,
    ExecutingTools,
    Responding,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TurnState::AwaitingUserInput => "awaiting_user_input",
            TurnState::ModelThinking => "model_thinking",
            TurnState::ExecutingTools => "executing_tools",
            TurnState::Responding => "responding",
        };
        f.write_str(label)
    }
}

/// Append-only message history of one conversation.
///
/// `append` enforces call/result pairing: results must answer the pending
/// calls of the immediately preceding assistant message, in request order,
/// and nothing else may be appended while calls are pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message, rejecting anything that breaks call/result pairing
    pub fn append(&mut self, message: Message) -> KbResult<()> {
        let pending = self.pending_tool_calls();
        match &message {
            Message::User { .. } | Message::Assistant { .. } if !pending.is_empty() => {
                return Err(KbError::InvalidHistory(format!(
                    "cannot append a {} message while {} tool call(s) await results",
                    message.role(),
                    pending.len()
                )));
            }
            Message::Assistant { tool_calls, .. } => {
                let mut seen = HashSet::new();
                for call in tool_calls {
                    if call.id.is_empty() || !seen.insert(call.id.as_str()) {
                        return Err(KbError::InvalidHistory(format!(
                            "tool call id '{}' is empty or repeated",
                            call.id
                        )));
                    }
                }
            }
            Message::Tool { tool_call_id, .. } => match pending.first() {
                Some(next) if next.id == *tool_call_id => {}
                Some(next) => {
                    return Err(KbError::InvalidHistory(format!(
                        "tool result '{}' out of order, expected '{}'",
                        tool_call_id, next.id
                    )));
                }
                None => {
                    return Err(KbError::InvalidHistory(format!(
                        "tool result '{}' does not answer a pending call",
                        tool_call_id
                    )));
                }
            },
            Message::User { .. } => {}
        }
        self.messages.push(message);
        Ok(())
    }

    /// Calls of the latest assistant message that have no result yet, in request order
    pub fn pending_tool_calls(&self) -> Vec<ToolCallRequest> {
        let mut answered = HashSet::new();
        for message in self.messages.iter().rev() {
            match message {
                Message::Tool { tool_call_id, .. } => {
                    answered.insert(tool_call_id.as_str());
                }
                Message::Assistant { tool_calls, .. } => {
                    return tool_calls
                        .iter()
                        .filter(|call| !answered.contains(call.id.as_str()))
                        .cloned()
                        .collect();
                }
                Message::User { .. } => break,
            }
        }
        Vec::new()
    }

    /// Tool call ids already used since the latest user message
    pub fn current_turn_call_ids(&self) -> HashSet<String> {
        self.messages
            .iter()
            .rev()
            .take_while(|m| !matches!(m, Message::User { .. }))
            .flat_map(|m| m.tool_calls().iter().map(|c| c.id.clone()))
            .collect()
    }

    /// State the turn machine resumes in for this history
    pub fn phase(&self) -> TurnState {
        match self.messages.last() {
            None => TurnState::AwaitingUserInput,
            Some(Message::User { .. }) => TurnState::ModelThinking,
            Some(Message::Tool { .. }) | Some(Message::Assistant { .. }) => {
                if !self.pending_tool_calls().is_empty() {
                    TurnState::ExecutingTools
                } else if matches!(self.messages.last(), Some(Message::Tool { .. })) {
                    TurnState::ModelThinking
                } else {
                    TurnState::AwaitingUserInput
                }
            }
        }
    }
}

/// Result of a completed turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Final assistant text
    pub answer: String,
    /// Tool-call rounds executed during the turn
    pub rounds: usize,
    /// Tool calls executed during the turn
    pub tool_calls: usize,
    /// The round cap ended the turn before the model produced an answer
    pub truncated: bool,
}

/// Progress notifications emitted while a turn runs
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    State(TurnState),
    /// Streamed fragment of assistant text
    Token(String),
    ToolStarted { id: String, name: String },
    ToolFinished { id: String, name: String, is_error: bool },
}
