use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::tool::{SideEffect, Tool, ToolOutput, ToolRegistry};

type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>>;
type ToolFn = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Binds a host-provided async function (a market-data lookup, a weather call,
/// a sandboxed interpreter) as a registry tool.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Option<Value>,
    side_effect: SideEffect,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            side_effect: SideEffect::Network,
            func: Arc::new(move |input| Box::pin(func(input))),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn with_side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        self.parameters.clone()
    }

    fn side_effect(&self) -> SideEffect {
        self.side_effect
    }

    async fn call(&self, input: Value) -> Result<ToolOutput> {
        (self.func)(input).await
    }
}

/// Reads a credential a provider wrapper needs, reporting its absence as a
/// configuration error so the turn is aborted instead of retried by the model.
pub fn required_credential(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AgentError::Configuration(format!(
            "missing credential: set the `{var}` environment variable"
        ))),
    }
}

/// Object schema with one required string property per `(name, description)` pair.
pub fn string_arguments(fields: &[(&str, &str)]) -> Value {
    let mut properties = serde_json::Map::new();
    for (name, description) in fields {
        properties.insert(
            (*name).to_string(),
            serde_json::json!({"type": "string", "description": description}),
        );
    }
    let required: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Builds a registry from a list of bound tools.
pub fn registry_from(tools: impl IntoIterator<Item = FunctionTool>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}
