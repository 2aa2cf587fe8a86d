//! Chat message history exchanged with the model router.

use serde::{Deserialize, Serialize};

use crate::state::ToolCall;

/// One message in a turn's history: system/user/assistant/tool, state-in state-out style.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    /// Whether this message is a user/assistant pair entry that soft-limit truncation
    /// is allowed to drop; the system slot is never truncated (design §4.2 step 2).
    pub fn is_truncatable(&self) -> bool {
        !matches!(self, Message::System { .. })
    }

    /// Rough token estimate (chars / 4), used only for `contextSoftLimit` budgeting.
    pub fn approx_tokens(&self) -> u32 {
        let len = match self {
            Message::System { content } => content.len(),
            Message::User { content } => content.len(),
            Message::Assistant { content, .. } => content.len(),
            Message::Tool { content, .. } => content.len(),
        };
        ((len / 4) as u32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_is_not_truncatable() {
        assert!(!Message::system("s").is_truncatable());
        assert!(Message::user("u").is_truncatable());
        assert!(Message::assistant("a").is_truncatable());
    }
}
