//! Frame: the single tagged variant exchanged with clients.
//!
//! Every frame has a `type` discriminator (serde's internal tag). Parse
//! failures never fail to produce *something* usable — callers turn a
//! `serde_json::Error` into `Frame::error(ErrorCode::InvalidFrame, ...)`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel a connection identifies itself with on `connect`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Chat,
    Cli,
    Dashboard,
    SubAgent,
    System,
}

/// Substream kind carried by a `stream` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Thinking,
    ToolCall,
    ToolResult,
    Response,
    Error,
    Status,
}

/// Fixed error codes the core ever emits on an `error` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Protocol,
    NoSession,
    InvalidFrame,
    Schema,
    Permission,
    Quota,
    RateLimit,
    QuotaExceeded,
    ContextOverflow,
    Auth,
    Timeout,
    Transient,
    Fatal,
    Busy,
    NoModels,
    NoRecipient,
}

impl ErrorCode {
    /// The fixed `code` string, as printed on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::NoSession => "NO_SESSION",
            ErrorCode::InvalidFrame => "INVALID_FRAME",
            ErrorCode::Schema => "SCHEMA",
            ErrorCode::Permission => "PERMISSION",
            ErrorCode::Quota => "QUOTA",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::ContextOverflow => "CONTEXT_OVERFLOW",
            ErrorCode::Auth => "AUTH",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::Fatal => "FATAL",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NoModels => "NO_MODELS",
            ErrorCode::NoRecipient => "NO_RECIPIENT",
        }
    }
}

/// One frame of the gateway's wire protocol.
///
/// Each variant maps to a JSON object with `"type": "<variant_name>"`
/// (snake_case), mirroring the client/server envelopes a WebSocket-based
/// agent runtime uses on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Connect {
        channel: Channel,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Message {
        session_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Stream {
        session_id: String,
        trace_id: String,
        stream_type: StreamType,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    ApprovalRequest {
        id: String,
        kind: String,
        description: String,
        #[serde(default)]
        meta: Value,
        expires_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_id: Option<String>,
    },
    ApprovalResponse {
        id: String,
        approved: bool,
    },
    InputRequest {
        id: String,
        description: String,
        expires_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    InputResponse {
        id: String,
        value: String,
    },
    TokenUpdate {
        model_id: String,
        role: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
        estimated_cost: f64,
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl Frame {
    /// Builds an `error` frame for the given fixed code.
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<String>) -> Self {
        Frame::Error {
            code: code.as_str().to_string(),
            message: message.into(),
            session_id,
        }
    }

    /// Parses one frame from a JSON string. On failure, the caller is
    /// expected to reply with `Frame::error(ErrorCode::InvalidFrame, ...)`.
    pub fn parse(text: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes this frame to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The session this frame is addressed to or originates from, if any.
    /// `Connect` before a session is assigned and broadcast frames (built
    /// with the sentinel id) both return values here; callers that care
    /// about "is this a broadcast" compare against [`crate::SENTINEL_SESSION_ID`].
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Frame::Connect { session_id, .. } => session_id.as_deref(),
            Frame::Message { session_id, .. } => Some(session_id),
            Frame::Stream { session_id, .. } => Some(session_id),
            Frame::ApprovalRequest { session_id, .. } => session_id.as_deref(),
            Frame::InputRequest { session_id, .. } => session_id.as_deref(),
            Frame::Error { session_id, .. } => session_id.as_deref(),
            Frame::ApprovalResponse { .. }
            | Frame::InputResponse { .. }
            | Frame::TokenUpdate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let json = frame.to_json().unwrap();
        let parsed = Frame::parse(&json).unwrap();
        assert_eq!(frame, parsed);
    }

    #[test]
    fn connect_roundtrip() {
        roundtrip(Frame::Connect {
            channel: Channel::Chat,
            session_id: None,
        });
        roundtrip(Frame::Connect {
            channel: Channel::SubAgent,
            session_id: Some("s-1".into()),
        });
    }

    #[test]
    fn connect_channel_is_kebab_case() {
        let json = Frame::Connect {
            channel: Channel::SubAgent,
            session_id: None,
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"sub-agent\""));
    }

    #[test]
    fn message_roundtrip() {
        roundtrip(Frame::Message {
            session_id: "s-1".into(),
            content: "hello".into(),
            metadata: Some(serde_json::json!({"k": "v"})),
        });
    }

    #[test]
    fn stream_roundtrip() {
        roundtrip(Frame::Stream {
            session_id: "s-1".into(),
            trace_id: "t-1".into(),
            stream_type: StreamType::ToolCall,
            delta: "reading file".into(),
            metadata: Some(serde_json::json!({"tool": "file_read"})),
        });
    }

    #[test]
    fn approval_request_roundtrip() {
        roundtrip(Frame::ApprovalRequest {
            id: "a-1".into(),
            kind: "tool_execution".into(),
            description: "run rm -rf /tmp/x".into(),
            meta: serde_json::json!({"tool": "file_write"}),
            expires_at: 1000,
            session_id: Some("s-1".into()),
            workspace_id: None,
        });
    }

    #[test]
    fn token_update_roundtrip() {
        roundtrip(Frame::TokenUpdate {
            model_id: "openai/gpt-4o".into(),
            role: "thinking".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            estimated_cost: 0.0003,
            timestamp: 42,
        });
    }

    #[test]
    fn error_frame_has_fixed_code_string() {
        let frame = Frame::error(ErrorCode::InvalidFrame, "bad json", None);
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"code\":\"INVALID_FRAME\""));
        roundtrip(frame);
    }

    #[test]
    fn parse_invalid_json_errors() {
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn session_id_accessor() {
        let f = Frame::Message {
            session_id: "s-9".into(),
            content: "hi".into(),
            metadata: None,
        };
        assert_eq!(f.session_id(), Some("s-9"));

        let f = Frame::ApprovalResponse {
            id: "a-1".into(),
            approved: true,
        };
        assert_eq!(f.session_id(), None);
    }
}
