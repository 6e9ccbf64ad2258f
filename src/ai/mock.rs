//! Scripted model gateway for tests and offline runs
//!
//! Replays a fixed queue of replies, one per invocation, and records the
//! history each invocation received.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use super::gateway::{AssistantReply, ModelGateway};
use crate::agent::types::{Message, ToolCallRequest};
use crate::error::{KbError, KbResult};
use crate::tools::ToolSpec;

#[derive(Debug, Clone)]
enum Step {
    Reply(AssistantReply),
    Fail(String),
    /// Never completes; for cancellation tests
    Hang,
}

/// Gateway that answers from a script
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Step>>,
    fallback: Option<AssistantReply>,
    seen: Mutex<Vec<(Vec<Message>, Vec<String>)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text answer
    pub fn then_text(self, content: impl Into<String>) -> Self {
        self.then(AssistantReply::text(content))
    }

    /// Queue a batch of tool calls
    pub fn then_calls(self, calls: Vec<ToolCallRequest>) -> Self {
        self.then(AssistantReply::calls(calls))
    }

    pub fn then(mut self, reply: AssistantReply) -> Self {
        self.script.get_mut().push_back(Step::Reply(reply));
        self
    }

    /// Queue a gateway failure
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.script.get_mut().push_back(Step::Fail(message.into()));
        self
    }

    /// Queue an invocation that never returns
    pub fn then_hang(mut self) -> Self {
        self.script.get_mut().push_back(Step::Hang);
        self
    }

    /// Reply used once the script is exhausted
    pub fn otherwise(mut self, reply: AssistantReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Number of invocations so far
    pub async fn invocations(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// History passed to the `n`th invocation
    pub async fn history_at(&self, n: usize) -> Option<Vec<Message>> {
        self.seen.lock().await.get(n).map(|(history, _)| history.clone())
    }

    /// Tool names bound at the `n`th invocation
    pub async fn tools_at(&self, n: usize) -> Option<Vec<String>> {
        self.seen.lock().await.get(n).map(|(_, tools)| tools.clone())
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn invoke(
        &self,
        history: &[Message],
        tools: &[ToolSpec],
        tokens: Option<&UnboundedSender<String>>,
    ) -> KbResult<AssistantReply> {
        self.seen.lock().await.push((
            history.to_vec(),
            tools.iter().map(|t| t.name.clone()).collect(),
        ));

        let step = self.script.lock().await.pop_front();
        let reply = match step {
            Some(Step::Reply(reply)) => reply,
            Some(Step::Fail(message)) => return Err(KbError::Gateway(message)),
            Some(Step::Hang) => futures::future::pending().await,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| KbError::Gateway("script exhausted".to_string()))?,
        };

        if let Some(tx) = tokens {
            for word in reply.content.split_inclusive(' ') {
                let _ = tx.send(word.to_string());
            }
        }
        Ok(reply)
    }
}
