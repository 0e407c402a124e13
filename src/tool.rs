use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::Artifact;

/// What invoking a tool may do to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    ReadOnly,
    Network,
    CodeExecution,
}

/// Result of a successful tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub artifact: Option<Artifact>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            artifact: None,
        }
    }

    pub fn json(value: &Value) -> Self {
        Self::text(value.to_string())
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema of the argument object.
    fn parameters(&self) -> Option<Value> {
        None
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::Network
    }

    async fn call(&self, input: Value) -> Result<ToolOutput>;
}

/// What the model is told about a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub side_effect: SideEffect,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_shared(Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.register(tool);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.tools
            .values()
            .map(|tool| ToolDescription {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
                side_effect: tool.side_effect(),
            })
            .collect()
    }

    /// A registry restricted to `names`, sharing the underlying tools.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut tools = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let tool = self.tools.get(name).ok_or_else(|| {
                AgentError::Configuration(format!("cannot bind unknown tool `{name}`"))
            })?;
            tools.insert(name.to_string(), Arc::clone(tool));
        }
        Ok(Self { tools })
    }

    /// Validates `input` against the tool's schema, then invokes it. Failures are
    /// wrapped as `ToolInvocation`, except configuration errors which pass through
    /// unchanged so the caller can abort the turn.
    pub async fn call(&self, name: &str, input: Value) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        if let Some(schema) = tool.parameters() {
            validate_arguments(&schema, &input).map_err(|reason| {
                AgentError::InvalidToolArguments {
                    name: name.to_string(),
                    reason,
                }
            })?;
        }
        tool.call(input).await.map_err(|err| {
            if err.is_fatal() {
                err
            } else {
                AgentError::tool(name, err)
            }
        })
    }
}

/// Structural check of tool arguments against the subset of JSON schema used for
/// tool declarations: object shape, `required` keys and primitive property types.
pub fn validate_arguments(schema: &Value, input: &Value) -> std::result::Result<(), String> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }
    let object = input
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, got `{input}`"))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("missing required field `{key}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                "null" => value.is_null(),
                _ => true,
            };
            if !matches {
                return Err(format!("field `{key}` must be of type {expected}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct QuoteTool;

    #[async_trait]
    impl Tool for QuoteTool {
        fn name(&self) -> &str {
            "get_stock_quote"
        }

        fn description(&self) -> &str {
            "Price and information about a stock for today"
        }

        fn parameters(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"ticker": {"type": "string"}},
                "required": ["ticker"]
            }))
        }

        async fn call(&self, input: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::json(&json!({"ticker": input["ticker"], "price": 421.5})))
        }
    }

    struct WeatherTool;

    #[async_trait]
    impl Tool for WeatherTool {
        fn name(&self) -> &str {
            "get_weather"
        }

        fn description(&self) -> &str {
            "Current weather for a location"
        }

        async fn call(&self, _input: Value) -> Result<ToolOutput> {
            Err(AgentError::Configuration(
                "Please provide an API key for OpenWeather".into(),
            ))
        }
    }

    #[tokio::test]
    async fn validates_before_invoking() {
        let registry = ToolRegistry::new().with_tool(QuoteTool);

        let ok = registry
            .call("get_stock_quote", json!({"ticker": "MSFT"}))
            .await
            .unwrap();
        assert!(ok.content.contains("421.5"));

        let missing = registry.call("get_stock_quote", json!({})).await;
        assert!(matches!(
            missing,
            Err(AgentError::InvalidToolArguments { .. })
        ));

        let wrong_type = registry
            .call("get_stock_quote", json!({"ticker": 42}))
            .await;
        assert!(wrong_type.is_err());
    }

    #[tokio::test]
    async fn configuration_errors_pass_through() {
        let registry = ToolRegistry::new().with_tool(WeatherTool);
        let err = registry.call("get_weather", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));

        let missing = registry.call("get_options_chain", json!({})).await;
        assert!(matches!(missing, Err(AgentError::ToolNotFound(_))));
    }

    #[test]
    fn subset_shares_tools_and_rejects_unknown_names() {
        let registry = ToolRegistry::new().with_tool(QuoteTool).with_tool(WeatherTool);
        let finance = registry.subset(&["get_stock_quote"]).unwrap();
        assert_eq!(finance.names(), vec!["get_stock_quote".to_string()]);
        assert!(registry.subset(&["get_stock_news"]).is_err());
        assert_eq!(registry.describe()[0].name, "get_stock_quote");
    }
}
