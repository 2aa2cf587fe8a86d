//! Tool trait and registry (design §4.2 step 4, generalized from the teacher's
//! `loom::tools::Tool` trait). Concrete tool implementations — shell, filesystem,
//! the skill loader — are external collaborators the runtime talks to only through
//! this narrow interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Description of one tool's name, purpose, and JSON argument schema, shown to the
/// model and used to validate its tool calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Per-call context threaded into a tool invocation (design §4.2: path/execution
/// permission checks need to know which agent and trace are calling).
#[derive(Clone, Debug)]
pub struct ToolCallContext {
    pub agent_id: String,
    pub trace_id: String,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("argument schema mismatch: {0}")]
    Schema(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// One tool callable by the model. Mirrors the teacher's `Tool` trait; `call` is the
/// only suspension point, matching the teacher's `async fn call`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    async fn call(&self, args: serde_json::Value, ctx: &ToolCallContext) -> Result<String, ToolError>;
}

/// Registry of tools keyed by name, with an optional per-agent allowlist applied at
/// dispatch (design §4.4 Agent.tool_allowlist).
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self, allowlist: Option<&[String]>) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|t| allowlist.map(|a| a.iter().any(|n| n == t.name())).unwrap_or(true))
            .map(|t| t.spec())
            .collect()
    }

    pub async fn call(&self, name: &str, args: serde_json::Value, ctx: &ToolCallContext) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.call(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: Some("echoes its input".to_string()),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext) -> Result<String, ToolError> {
            Ok(args.to_string())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let ctx = ToolCallContext {
            agent_id: "a1".into(),
            trace_id: "t1".into(),
        };
        let result = registry.call("echo", serde_json::json!({"x": 1}), &ctx).await.unwrap();
        assert_eq!(result, "{\"x\":1}");
    }

    #[tokio::test]
    async fn unknown_tool_name_errors() {
        let registry = ToolRegistry::new();
        let ctx = ToolCallContext {
            agent_id: "a1".into(),
            trace_id: "t1".into(),
        };
        let err = registry.call("missing", serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn specs_respects_allowlist() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.specs(Some(&["other".to_string()])).len(), 0);
        assert_eq!(registry.specs(None).len(), 1);
    }
}
