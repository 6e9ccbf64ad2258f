//! OpenAI-compatible chat completions and embeddings client
//!
//! Speaks `/chat/completions` with function tools (`tool_choice: "auto"`) in
//! both plain and SSE streaming mode, and `/embeddings` for ingestion and
//! queries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::embedding::Embedder;
use super::gateway::{AssistantReply, GatewaySettings, ModelGateway};
use crate::agent::types::{Message, ToolCallRequest};
use crate::error::{KbError, KbResult};
use crate::tools::ToolSpec;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    typ: &'static str,
    function: WireFunctionDef<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    typ: String,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Map conversation history onto the chat-completions message list
fn to_wire(history: &[Message], system_prompt: Option<&str>) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(prompt) = system_prompt {
        messages.push(WireMessage {
            role: "system",
            content: Some(prompt.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
    }
    for message in history {
        let wire = match message {
            Message::User { content } => WireMessage {
                role: "user",
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            Message::Assistant { content, tool_calls } => WireMessage {
                role: "assistant",
                content: if content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(content.clone())
                },
                tool_calls: tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        typ: function_type(),
                        function: WireFunctionCall {
                            name: call.tool_name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
                tool_call_id: None,
            },
            Message::Tool { tool_call_id, content, .. } => WireMessage {
                role: "tool",
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: Some(tool_call_id.clone()),
            },
        };
        messages.push(wire);
    }
    messages
}

/// Arguments arrive as a JSON string; anything unparsable is kept verbatim
/// so the tool reports it as invalid input.
fn parse_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn from_wire_call(call: WireToolCall) -> ToolCallRequest {
    ToolCallRequest::new(call.id, call.function.name, parse_arguments(&call.function.arguments))
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental assembly of a streamed chat completion
#[derive(Debug, Default)]
struct StreamAssembler {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    done: bool,
}

impl StreamAssembler {
    /// Feed one SSE line; returns the content delta it carried, if any
    fn feed_line(&mut self, line: &str) -> Option<String> {
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }
        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparsable stream chunk");
                return None;
            }
        };
        let delta = chunk.choices.into_iter().next()?.delta;

        for call in delta.tool_calls.unwrap_or_default() {
            let entry = self.calls.entry(call.index).or_default();
            if let Some(id) = call.id {
                entry.id = id;
            }
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    entry.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    entry.arguments.push_str(&arguments);
                }
            }
        }

        match delta.content {
            Some(content) if !content.is_empty() => {
                self.content.push_str(&content);
                Some(content)
            }
            _ => None,
        }
    }

    fn finish(self) -> AssistantReply {
        AssistantReply {
            content: self.content,
            tool_calls: self
                .calls
                .into_values()
                .map(|call| ToolCallRequest::new(call.id, call.name, parse_arguments(&call.arguments)))
                .collect(),
        }
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> KbError {
    match status.as_u16() {
        401 | 403 => KbError::Configuration(format!(
            "provider rejected the credentials ({}): {}",
            status, body
        )),
        429 => KbError::Gateway(format!("rate limited ({}): {}", status, body)),
        _ => KbError::Gateway(format!("provider error {}: {}", status, body)),
    }
}

/// Client for an OpenAI-compatible HTTP API
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    settings: GatewaySettings,
}

impl OpenAiClient {
    /// Build a client, refusing settings without credentials
    pub fn new(settings: GatewaySettings) -> KbResult<Self> {
        settings.validate()?;
        Ok(Self {
            client: reqwest::Client::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn request_body<'a>(&'a self, history: &[Message], tools: &'a [ToolSpec], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.settings.model,
            messages: to_wire(history, self.settings.system_prompt.as_deref()),
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    typ: "function",
                    function: WireFunctionDef {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.input_schema,
                    },
                })
                .collect(),
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            temperature: self.settings.temperature,
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> KbResult<reqwest::Response> {
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        Ok(response)
    }

    async fn complete(&self, body: &ChatRequest<'_>) -> KbResult<AssistantReply> {
        let text = self.send(body).await?.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| KbError::Gateway(format!("malformed completion: {}; body: {}", e, text)))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| KbError::Gateway("completion has no choices".to_string()))?
            .message;
        Ok(AssistantReply {
            content: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(from_wire_call)
                .collect(),
        })
    }

    async fn complete_streaming(
        &self,
        body: &ChatRequest<'_>,
        tokens: Option<&UnboundedSender<String>>,
    ) -> KbResult<AssistantReply> {
        let mut stream = self.send(body).await?.bytes_stream();
        let mut assembler = StreamAssembler::default();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(delta) = assembler.feed_line(&line) {
                    if let Some(tx) = tokens {
                        let _ = tx.send(delta);
                    }
                }
            }
            if assembler.done {
                break;
            }
        }
        if !assembler.done {
            if let Some(delta) = assembler.feed_line(&String::from_utf8_lossy(&buffer)) {
                if let Some(tx) = tokens {
                    let _ = tx.send(delta);
                }
            }
            tracing::debug!("stream ended without [DONE]");
        }
        Ok(assembler.finish())
    }
}

#[async_trait]
impl ModelGateway for OpenAiClient {
    #[tracing::instrument(skip_all, fields(model = %self.settings.model, messages = history.len(), tools = tools.len()))]
    async fn invoke(
        &self,
        history: &[Message],
        tools: &[ToolSpec],
        tokens: Option<&UnboundedSender<String>>,
    ) -> KbResult<AssistantReply> {
        let stream = self.settings.stream;
        let body = self.request_body(history, tools, stream);
        let reply = if stream {
            self.complete_streaming(&body, tokens).await?
        } else {
            let reply = self.complete(&body).await?;
            if let (Some(tx), false) = (tokens, reply.content.is_empty()) {
                let _ = tx.send(reply.content.clone());
            }
            reply
        };
        tracing::debug!(tool_calls = reply.tool_calls.len(), "model replied");
        Ok(reply)
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(self.url("embeddings"))
            .bearer_auth(&self.settings.api_key)
            .json(&EmbeddingRequest {
                model: &self.settings.embedding_model,
                input: texts,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_maps_to_wire_roles() {
        let history = vec![
            Message::user("hi"),
            Message::assistant_with_calls(
                "",
                vec![ToolCallRequest::new("c1", "docs_knowledge_base_tool", json!({ "query": "q" }))],
            ),
            Message::tool_result("c1", "{}"),
            Message::assistant("done"),
        ];
        let wire = serde_json::to_value(to_wire(&history, Some("be brief"))).unwrap();
        assert_eq!(wire[0], json!({ "role": "system", "content": "be brief" }));
        assert_eq!(wire[1], json!({ "role": "user", "content": "hi" }));
        assert_eq!(
            wire[2],
            json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": "c1",
                    "type": "function",
                    "function": { "name": "docs_knowledge_base_tool", "arguments": "{\"query\":\"q\"}" }
                }]
            })
        );
        assert_eq!(wire[3], json!({ "role": "tool", "content": "{}", "tool_call_id": "c1" }));
        assert_eq!(wire[4], json!({ "role": "assistant", "content": "done" }));
    }

    #[test]
    fn test_stream_assembles_content_and_tool_calls() {
        let mut assembler = StreamAssembler::default();
        let lines = [
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"kb_tool","arguments":"{\"qu"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"other","arguments":"{}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ery\":\"x\"}"}}]}}]}"#,
            ": keep-alive",
            "data: [DONE]",
        ];
        let deltas: Vec<String> = lines.iter().filter_map(|l| assembler.feed_line(l)).collect();
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert!(assembler.done);

        let reply = assembler.finish();
        assert_eq!(reply.content, "Hello");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].id, "c1");
        assert_eq!(reply.tool_calls[0].tool_name, "kb_tool");
        assert_eq!(reply.tool_calls[0].arguments, json!({ "query": "x" }));
        assert_eq!(reply.tool_calls[1].tool_name, "other");
    }

    #[test]
    fn test_unparsable_arguments_kept_verbatim() {
        assert_eq!(parse_arguments("{oops"), Value::String("{oops".to_string()));
        assert_eq!(parse_arguments("{\"query\":\"a\"}"), json!({ "query": "a" }));
    }

    #[test]
    fn test_status_mapping() {
        let err = status_error(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(err, KbError::Configuration(_)));
        let err = status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, KbError::Gateway(_)));
    }

    #[test]
    fn test_client_requires_api_key() {
        assert!(OpenAiClient::new(GatewaySettings::default()).is_err());
    }
}
