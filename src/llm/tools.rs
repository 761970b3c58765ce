//! Tool registry for model-invoked function calls
//!
//! Each tool declares a name, description, and JSON schema for its
//! parameters. Execution is bounded by a timeout; failures come back as an
//! error payload in the tool result so the model can react instead of the
//! turn dying.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::{FunctionDefinition, ToolCall, ToolDefinition};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the accepted arguments
    fn parameters(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
        }
    }

    /// Empty registry for sessions without tools
    pub fn empty() -> Self {
        Self::new(Duration::from_secs(15))
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions advertised to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }

    /// Execute one call; always yields a JSON payload suitable for a tool
    /// result message
    pub async fn execute(&self, call: &ToolCall) -> Value {
        let name = &call.function.name;
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = %name, "model called an unregistered tool");
            return json!({"error": format!("unknown tool: {}", name)});
        };

        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => {
                return json!({"error": format!("invalid arguments: {}", e)});
            }
        };

        debug!(tool = %name, "executing tool call");
        match tokio::time::timeout(self.timeout, tool.execute(args)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => json!({"error": e.to_string()}),
            Err(_) => json!({
                "error": format!("tool timed out after {}s", self.timeout.as_secs())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::FunctionCall;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })
        }
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(json!({"echoed": args["text"]}))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Tool for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn description(&self) -> &str {
            "Never returns"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Result<Value> {
            futures::future::pending().await
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(Echo));
        assert_eq!(registry.definitions().len(), 1);

        let result = registry.execute(&call("echo", r#"{"text":"hi"}"#)).await;
        assert_eq!(result["echoed"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args_become_error_payloads() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(Echo));

        let result = registry.execute(&call("missing", "{}")).await;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));

        let result = registry.execute(&call("echo", "not json")).await;
        assert!(result["error"].as_str().unwrap().contains("invalid arguments"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tool_times_out() {
        let mut registry = ToolRegistry::new(Duration::from_millis(50));
        registry.register(Arc::new(Stuck));

        let result = registry.execute(&call("stuck", "{}")).await;
        assert!(result["error"].as_str().unwrap().contains("timed out"));
    }
}
