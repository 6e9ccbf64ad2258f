//! Agent turn orchestration
//!
//! A turn starts with a user message and alternates between asking the
//! model and running the tool calls it requests until the model answers in
//! plain text:
//!
//! ```text
//! AwaitingUserInput -> ModelThinking -> ExecutingTools -> ModelThinking -> ... -> Responding
//! ```
//!
//! The conversation is checkpointed after every step, so a turn interrupted
//! by a gateway failure can be picked up again with
//! [`Orchestrator::resume_turn`].
//!
//! # Example
//!
//! ```rust,ignore
//! use kbchat::agent::{Orchestrator, checkpoint::MemoryCheckpointStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let agent = Orchestrator::new(gateway, tools, Arc::new(MemoryCheckpointStore::new()));
//! let outcome = agent.run_turn("default", "How do I reset my router?", &CancellationToken::new(), None).await?;
//! println!("{}", outcome.answer);
//! ```

pub mod checkpoint;
pub mod types;

pub use checkpoint::{CheckpointStore, ConversationGuard, ConversationLocks, FjallCheckpointStore, MemoryCheckpointStore};
pub use types::{
    ConversationId, ConversationState, Message, ToolCallRequest, TurnEvent, TurnOutcome, TurnState,
};

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::{AssistantReply, ModelGateway};
use crate::error::{KbError, KbResult};
use crate::tools::{error_payload, ToolSet};

/// Default cap on tool-call rounds per turn
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Drives conversation turns against a model gateway and a tool set
pub struct Orchestrator {
    gateway: Arc<dyn ModelGateway>,
    tools: ToolSet,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: ConversationLocks,
    max_tool_rounds: usize,
}

impl Orchestrator {
    pub fn new(gateway: Arc<dyn ModelGateway>, tools: ToolSet, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            gateway,
            tools,
            checkpoints,
            locks: ConversationLocks::new(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Stored history of a conversation (empty when unknown)
    pub async fn history(&self, conversation: &str) -> KbResult<ConversationState> {
        Ok(self.checkpoints.load(conversation).await?.unwrap_or_default())
    }

    pub async fn conversations(&self) -> KbResult<Vec<String>> {
        self.checkpoints.list().await
    }

    /// Drop a conversation's history
    pub async fn forget(&self, conversation: &str) -> KbResult<bool> {
        let _lock = self.locks.acquire(conversation).await;
        self.checkpoints.delete(conversation).await
    }

    /// Run one turn for a new user message.
    ///
    /// Tool calls left pending by an interrupted turn are settled first so
    /// the history stays well formed.
    #[tracing::instrument(skip_all, fields(conversation = %conversation))]
    pub async fn run_turn(
        &self,
        conversation: &str,
        text: &str,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> KbResult<TurnOutcome> {
        let _lock = self.locks.acquire(conversation).await;
        let mut state = self.history(conversation).await?;

        if !state.pending_tool_calls().is_empty() {
            tracing::info!("settling tool calls left by an interrupted turn");
            self.execute_pending(conversation, &mut state, cancel, events).await?;
        }

        state.append(Message::user(text))?;
        self.checkpoints.save(conversation, &state).await?;
        self.drive(conversation, state, cancel, events).await
    }

    /// Finish a turn that stopped before the model answered
    #[tracing::instrument(skip_all, fields(conversation = %conversation))]
    pub async fn resume_turn(
        &self,
        conversation: &str,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> KbResult<TurnOutcome> {
        let _lock = self.locks.acquire(conversation).await;
        let state = self.history(conversation).await?;
        if state.phase() == TurnState::AwaitingUserInput {
            return Err(KbError::InvalidHistory(format!(
                "conversation '{}' has no unfinished turn",
                conversation
            )));
        }
        self.drive(conversation, state, cancel, events).await
    }

    async fn drive(
        &self,
        conversation: &str,
        mut state: ConversationState,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> KbResult<TurnOutcome> {
        loop {
            if !state.pending_tool_calls().is_empty() {
                self.execute_pending(conversation, &mut state, cancel, events).await?;
                continue;
            }

            emit(events, TurnEvent::State(TurnState::ModelThinking));
            let reply = self.think(&state, cancel, events).await?;
            let (rounds, tool_calls) = turn_stats(&state);

            if !reply.wants_tools() {
                state.append(Message::assistant(reply.content.clone()))?;
                self.checkpoints.save(conversation, &state).await?;
                emit(events, TurnEvent::State(TurnState::Responding));
                return Ok(TurnOutcome {
                    answer: reply.content,
                    rounds,
                    tool_calls,
                    truncated: false,
                });
            }

            if rounds >= self.max_tool_rounds {
                tracing::warn!(rounds, "tool round cap reached, ending turn");
                let answer = format!(
                    "I stopped after {} rounds of knowledge base lookups without reaching an answer. \
                     Please narrow the question down or ask again.",
                    rounds
                );
                emit(events, TurnEvent::Token(answer.clone()));
                state.append(Message::assistant(answer.clone()))?;
                self.checkpoints.save(conversation, &state).await?;
                emit(events, TurnEvent::State(TurnState::Responding));
                return Ok(TurnOutcome {
                    answer,
                    rounds,
                    tool_calls,
                    truncated: true,
                });
            }

            let calls = assign_call_ids(&state, reply.tool_calls);
            tracing::debug!(calls = calls.len(), round = rounds + 1, "model requested tools");
            state.append(Message::assistant_with_calls(reply.content, calls))?;
            self.checkpoints.save(conversation, &state).await?;
        }
    }

    /// Ask the model for the next message, forwarding streamed tokens
    async fn think(
        &self,
        state: &ConversationState,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> KbResult<AssistantReply> {
        let specs = self.tools.specs();
        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
        let invoke = self
            .gateway
            .invoke(state.messages(), &specs, events.map(|_| &token_tx));
        tokio::pin!(invoke);

        let reply = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KbError::Cancelled),
                result = &mut invoke => break result?,
                Some(token) = token_rx.recv() => emit(events, TurnEvent::Token(token)),
            }
        };
        while let Ok(token) = token_rx.try_recv() {
            emit(events, TurnEvent::Token(token));
        }
        Ok(reply)
    }

    /// Run every pending call concurrently and append the results in request order
    async fn execute_pending(
        &self,
        conversation: &str,
        state: &mut ConversationState,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> KbResult<()> {
        let pending = state.pending_tool_calls();
        emit(events, TurnEvent::State(TurnState::ExecutingTools));

        let batch = join_all(pending.iter().map(|call| self.execute_call(call, events)));
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KbError::Cancelled),
            results = batch => results,
        };

        for (call, (content, is_error)) in pending.iter().zip(results) {
            let message = if is_error {
                Message::tool_error(call.id.clone(), content)
            } else {
                Message::tool_result(call.id.clone(), content)
            };
            state.append(message)?;
        }
        self.checkpoints.save(conversation, state).await
    }

    /// Run one call; every failure becomes an error payload for the model
    async fn execute_call(
        &self,
        call: &ToolCallRequest,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> (String, bool) {
        emit(
            events,
            TurnEvent::ToolStarted {
                id: call.id.clone(),
                name: call.tool_name.clone(),
            },
        );

        let result = match self.tools.resolve(&call.tool_name) {
            Ok(tool) => tool.call(&call.arguments).await,
            Err(e) => Err(e),
        };
        let (content, is_error) = match result {
            Ok(payload) => (payload, false),
            Err(e) => {
                if e.is_tool_recoverable() {
                    tracing::warn!(tool = %call.tool_name, error = %e, "tool call failed");
                } else {
                    tracing::error!(tool = %call.tool_name, error = %e, "tool call failed unexpectedly");
                }
                (error_payload(&e.to_string()), true)
            }
        };

        emit(
            events,
            TurnEvent::ToolFinished {
                id: call.id.clone(),
                name: call.tool_name.clone(),
                is_error,
            },
        );
        (content, is_error)
    }
}

fn emit(events: Option<&UnboundedSender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Tool rounds and tool calls since the latest user message
fn turn_stats(state: &ConversationState) -> (usize, usize) {
    state
        .messages()
        .iter()
        .rev()
        .take_while(|m| !matches!(m, Message::User { .. }))
        .filter(|m| !m.tool_calls().is_empty())
        .fold((0, 0), |(rounds, calls), m| (rounds + 1, calls + m.tool_calls().len()))
}

/// Replace empty or already used call ids with fresh ones
fn assign_call_ids(state: &ConversationState, calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut used = state.current_turn_call_ids();
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || used.contains(&call.id) {
                let fresh = format!("call_{}", Uuid::new_v4().simple());
                tracing::debug!(old = %call.id, new = %fresh, "reassigned tool call id");
                call.id = fresh;
            }
            used.insert(call.id.clone());
            call
        })
        .collect()
}
