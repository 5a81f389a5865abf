//! Tool registry and the dispatch boundary that turns every outcome into a payload.
use crate::ToolCallRequest;
use crate::error::ToolError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

/// A function the assistant can call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments (`type: object`).
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: Map<String, Value>) -> Result<Value, ToolError>;
}

/// What the backend is told about a tool.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own name, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!("tool {} registered twice, keeping the latest", name);
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Human readable usage of one tool.
    pub fn help(&self, name: &str) -> Option<String> {
        let tool = self.tools.get(name)?;
        let schema = tool.parameters();
        let required = required_names(&schema);
        let mut text = format!("{}\n\n{}\n", tool.name(), tool.description());
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            text.push_str("\nParameters:\n");
            for (param, spec) in properties {
                let kind = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                let marker = if required.contains(&param.as_str()) {
                    "required"
                } else {
                    "optional"
                };
                let description = spec
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                text.push_str(&format!("  {param} ({kind}, {marker}): {description}\n"));
            }
        }
        Some(text)
    }

    /// Validates the arguments against the tool's schema, then runs it.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        validate_arguments(&tool.parameters(), &arguments)?;
        tool.execute(arguments).await
    }
}

fn required_names(schema: &Value) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Checks required, unexpected, typed and enumerated parameters.
pub fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), ToolError> {
    for name in required_names(schema) {
        if !arguments.contains_key(name) {
            return Err(ToolError::InvalidArguments(format!(
                "missing required parameter: {name}"
            )));
        }
    }

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    for (name, value) in arguments {
        let Some(spec) = properties.get(name) else {
            return Err(ToolError::InvalidArguments(format!(
                "unexpected parameter: {name}"
            )));
        };
        if let Some(expected) = spec.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(ToolError::InvalidArguments(format!(
                    "parameter {name} must be of type {expected}"
                )));
            }
        }
        if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(ToolError::InvalidArguments(format!(
                    "parameter {name} must be one of {}",
                    Value::Array(allowed.clone())
                )));
            }
        }
    }
    Ok(())
}

pub fn error_payload(message: impl Display) -> Value {
    json!({ "error": message.to_string() })
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one tool call to a payload. Never fails: unknown tools, invalid arguments,
/// errors, panics and timeouts all become `{"error": ...}`.
///
/// The handler runs on its own task so a panic cannot take the caller down; that task
/// is aborted if this future is dropped.
pub async fn dispatch(registry: Arc<ToolRegistry>, request: ToolCallRequest, limit: Duration) -> Value {
    let ToolCallRequest {
        id,
        name,
        arguments,
    } = request;
    tracing::info!("calling tool {} (call {})", name, id);

    let tool_name = name.clone();
    let task = tokio::spawn(async move { registry.execute(&tool_name, arguments).await });
    let _guard = AbortOnDrop(task.abort_handle());

    let outcome = match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => Err(ToolError::Panicked),
        Ok(Err(join_error)) => Err(ToolError::Failed(join_error.to_string())),
        Err(_) => Err(ToolError::Timeout(limit)),
    };
    match outcome {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("tool {} (call {}) failed: {}", name, id, e);
            error_payload(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_like_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {"type": "string", "description": "City name"},
                "days": {"type": "integer"},
                "unit": {"type": "string", "enum": ["F", "C", "K"]}
            },
            "required": ["location"]
        })
    }

    fn mock_tool(name: &'static str) -> MockTool {
        let mut tool = MockTool::new();
        tool.expect_name().return_const(name.to_string());
        tool.expect_description()
            .return_const("Look up the weather".to_string());
        tool.expect_parameters().returning(weather_like_schema);
        tool
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_reports_missing_required() {
        let err = validate_arguments(&weather_like_schema(), &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: location");
    }

    #[test]
    fn test_validate_rejects_unexpected_and_mistyped() {
        let schema = weather_like_schema();
        let err = validate_arguments(&schema, &args(json!({"location": "Oslo", "color": "red"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected parameter: color");

        let err = validate_arguments(&schema, &args(json!({"location": 12}))).unwrap_err();
        assert_eq!(err.to_string(), "parameter location must be of type string");

        let err = validate_arguments(&schema, &args(json!({"location": "Oslo", "days": 1.5})))
            .unwrap_err();
        assert_eq!(err.to_string(), "parameter days must be of type integer");
    }

    #[test]
    fn test_validate_checks_enum() {
        let schema = weather_like_schema();
        assert!(validate_arguments(&schema, &args(json!({"location": "Oslo", "unit": "C"}))).is_ok());
        let err = validate_arguments(&schema, &args(json!({"location": "Oslo", "unit": "R"})))
            .unwrap_err();
        assert!(err.to_string().starts_with("parameter unit must be one of"));
    }

    #[tokio::test]
    async fn test_unknown_tool_payload() {
        let registry = Arc::new(ToolRegistry::new());
        let request = ToolCallRequest {
            id: "call_1".into(),
            name: "frobnicate".into(),
            arguments: Map::new(),
        };
        let payload = dispatch(registry, request, Duration::from_secs(1)).await;
        assert_eq!(payload, json!({"error": "tool not found"}));
    }

    #[tokio::test]
    async fn test_dispatch_runs_validated_tool() {
        let mut tool = mock_tool("get_weather");
        tool.expect_execute()
            .withf(|arguments| arguments.get("location") == Some(&json!("Oslo")))
            .times(1)
            .returning(|_| Ok(json!({"temperature": 3})));
        let registry = Arc::new(ToolRegistry::new().with_tool(Arc::new(tool)));
        let request = ToolCallRequest {
            id: "call_2".into(),
            name: "get_weather".into(),
            arguments: args(json!({"location": "Oslo"})),
        };
        let payload = dispatch(registry, request, Duration::from_secs(1)).await;
        assert_eq!(payload, json!({"temperature": 3}));
    }

    #[tokio::test]
    async fn test_dispatch_never_runs_tool_with_bad_arguments() {
        let mut tool = mock_tool("get_weather");
        tool.expect_execute().never();
        let registry = Arc::new(ToolRegistry::new().with_tool(Arc::new(tool)));
        let request = ToolCallRequest {
            id: "call_3".into(),
            name: "get_weather".into(),
            arguments: Map::new(),
        };
        let payload = dispatch(registry, request, Duration::from_secs(1)).await;
        assert_eq!(payload, json!({"error": "missing required parameter: location"}));
    }

    #[tokio::test]
    async fn test_dispatch_converts_failure() {
        let mut tool = mock_tool("get_weather");
        tool.expect_execute()
            .returning(|_| Err(ToolError::Failed("upstream returned 500".into())));
        let registry = Arc::new(ToolRegistry::new().with_tool(Arc::new(tool)));
        let request = ToolCallRequest {
            id: "call_4".into(),
            name: "get_weather".into(),
            arguments: args(json!({"location": "Oslo"})),
        };
        let payload = dispatch(registry, request, Duration::from_secs(1)).await;
        assert_eq!(payload, json!({"error": "upstream returned 500"}));
    }

    struct Stuck;

    #[async_trait]
    impl Tool for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn description(&self) -> &str {
            "never returns"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
            std::future::pending().await
        }
    }

    struct Explodes;

    #[async_trait]
    impl Tool for Explodes {
        fn name(&self) -> &str {
            "explodes"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn test_dispatch_times_out() {
        let registry = Arc::new(ToolRegistry::new().with_tool(Arc::new(Stuck)));
        let request = ToolCallRequest {
            id: "call_5".into(),
            name: "stuck".into(),
            arguments: Map::new(),
        };
        let payload = dispatch(registry, request, Duration::from_millis(20)).await;
        assert_eq!(payload, json!({"error": "tool timed out after 20ms"}));
    }

    #[tokio::test]
    async fn test_dispatch_catches_panic() {
        let registry = Arc::new(ToolRegistry::new().with_tool(Arc::new(Explodes)));
        let request = ToolCallRequest {
            id: "call_6".into(),
            name: "explodes".into(),
            arguments: Map::new(),
        };
        let payload = dispatch(registry, request, Duration::from_secs(1)).await;
        assert_eq!(payload, json!({"error": "tool panicked"}));
    }

    #[test]
    fn test_definitions_and_help() {
        let registry = ToolRegistry::new().with_tool(Arc::new(mock_tool("get_weather")));
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "get_weather");
        assert_eq!(definitions[0].parameters, weather_like_schema());

        let help = registry.help("get_weather").unwrap();
        assert!(help.starts_with("get_weather\n\nLook up the weather\n"));
        assert!(help.contains("location (string, required): City name"));
        assert!(help.contains("unit (string, optional)"));
        assert!(registry.help("nope").is_none());
    }
}
