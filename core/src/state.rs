//! Tool-call / tool-result types shared between the runtime, router, and tool registry.
//!
//! Mirrors the teacher's state-in/state-out `ToolCall`/`ToolResult` shape, generalized to
//! carry the trace id that links a call to its audit entries (design §3, Audit Entry).

use serde::{Deserialize, Serialize};

/// One tool call requested by the model during a turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of executing one [`ToolCall`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    /// Set when a tool invocation was blocked by an approval denial or a
    /// permission check; distinct from a model-correctable `is_error`.
    #[serde(default)]
    pub blocked: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            blocked: false,
        }
    }

    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
            blocked: false,
        }
    }

    pub fn denied(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: serde_json::json!({"blocked": true, "reason": reason.into()}).to_string(),
            is_error: false,
            blocked: true,
        }
    }
}
