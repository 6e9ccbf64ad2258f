//! Tool definitions bound to the model
//!
//! Every tool takes a single `query` string and answers with a text payload.
//! Tools are looked up by name in a [`ToolSet`].

pub mod retrieval;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{KbError, KbResult};

pub use retrieval::{RetrievalSettings, RetrievalToolFactory};

/// Tool declaration as advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// Arguments accepted by every knowledge base tool
#[derive(Debug, Serialize, Deserialize)]
pub struct KbQueryInput {
    pub query: String,
}

impl KbQueryInput {
    pub fn from_arguments(arguments: &Value) -> KbResult<Self> {
        serde_json::from_value(arguments.clone())
            .map_err(|e| KbError::InvalidInput(format!("Invalid params: {}", e)))
    }
}

/// Input schema with a single required `query` string
pub fn query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "What to look up in the knowledge base"
            }
        },
        "required": ["query"]
    })
}

/// Payload reported to the model when a tool call fails
pub fn error_payload(message: &str) -> String {
    json!({ "error": message }).to_string()
}

pub type ToolFuture = BoxFuture<'static, KbResult<String>>;
pub type ToolFn = Arc<dyn Fn(String) -> ToolFuture + Send + Sync>;

/// A bound tool: its declaration plus the function that runs it
#[derive(Clone)]
pub struct ToolDescriptor {
    spec: ToolSpec,
    execute: ToolFn,
}

impl ToolDescriptor {
    pub fn new(spec: ToolSpec, execute: ToolFn) -> Self {
        Self { spec, execute }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Run the tool with an already extracted query
    pub fn run(&self, query: String) -> ToolFuture {
        (self.execute)(query)
    }

    /// Validate model-supplied arguments and run the tool
    pub async fn call(&self, arguments: &Value) -> KbResult<String> {
        let input = KbQueryInput::from_arguments(arguments)?;
        self.run(input.query).await
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Tools bound to a conversation, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; a second tool with an existing name is ignored
    pub fn insert(&mut self, tool: ToolDescriptor) -> bool {
        if self.tools.contains_key(tool.name()) {
            tracing::warn!(tool = tool.name(), "duplicate tool name, keeping the first binding");
            return false;
        }
        self.tools.insert(tool.name().to_string(), tool);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> KbResult<&ToolDescriptor> {
        self.tools
            .get(name)
            .ok_or_else(|| KbError::UnknownTool(name.to_string()))
    }

    /// Declarations to hand to the model, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec().clone()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl FromIterator<ToolDescriptor> for ToolSet {
    fn from_iter<I: IntoIterator<Item = ToolDescriptor>>(iter: I) -> Self {
        let mut set = ToolSet::new();
        for tool in iter {
            set.insert(tool);
        }
        set
    }
}
