//! Append-only audit log (design §3 Audit Entry, §4.1 audit broadcast bridge).
//!
//! Persisted the way the teacher persists its `Store`/`Checkpointer`: a thin struct holding a
//! `PathBuf`, one SQLite connection opened per operation inside `spawn_blocking`. A
//! `tokio::sync::broadcast` channel fans every appended entry out to subscribers (the
//! transport layer turns each into a `stream` frame per design §4.1).

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::GatewayError;

/// Closed set of audit action types (design §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ModelCall,
    ModelResponse,
    ToolCall,
    ToolResult,
    Thinking,
    MessageSent,
    MessageReceived,
    SecurityEvent,
    Error,
    SubAgentSpawn,
    CronTick,
}

impl ActionType {
    fn as_str(self) -> &'static str {
        match self {
            ActionType::ModelCall => "model_call",
            ActionType::ModelResponse => "model_response",
            ActionType::ToolCall => "tool_call",
            ActionType::ToolResult => "tool_result",
            ActionType::Thinking => "thinking",
            ActionType::MessageSent => "message_sent",
            ActionType::MessageReceived => "message_received",
            ActionType::SecurityEvent => "security_event",
            ActionType::Error => "error",
            ActionType::SubAgentSpawn => "sub_agent_spawn",
            ActionType::CronTick => "cron_tick",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "model_call" => ActionType::ModelCall,
            "model_response" => ActionType::ModelResponse,
            "tool_call" => ActionType::ToolCall,
            "tool_result" => ActionType::ToolResult,
            "thinking" => ActionType::Thinking,
            "message_sent" => ActionType::MessageSent,
            "message_received" => ActionType::MessageReceived,
            "security_event" => ActionType::SecurityEvent,
            "error" => ActionType::Error,
            "sub_agent_spawn" => ActionType::SubAgentSpawn,
            "cron_tick" => ActionType::CronTick,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
    Blocked,
    Pending,
}

impl AuditStatus {
    fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Blocked => "blocked",
            AuditStatus::Pending => "pending",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "success" => AuditStatus::Success,
            "error" => AuditStatus::Error,
            "blocked" => AuditStatus::Blocked,
            "pending" => AuditStatus::Pending,
            _ => return None,
        })
    }
}

/// One append-only audit entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub trace_id: String,
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub status: AuditStatus,
    pub created_at: i64,
}

impl AuditEntry {
    /// A deterministic, length-bounded one-line rendering used as the `delta`
    /// of the `stream(status)` frame the transport layer broadcasts (design §4.1).
    pub fn as_status_delta(&self) -> String {
        let rendered = format!(
            "[{}] {} trace={} status={:?} {}",
            self.created_at,
            self.action_type.as_str(),
            self.trace_id,
            self.status,
            self.payload
        );
        if rendered.chars().count() > 200 {
            rendered.chars().take(200).collect()
        } else {
            rendered
        }
    }
}

/// SQLite-backed append-only audit log with a broadcast tap for live subscribers.
pub struct AuditLog {
    db_path: PathBuf,
    tap: broadcast::Sender<AuditEntry>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        let (tap, _) = broadcast::channel(1024);
        Ok(Self { db_path, tap })
    }

    /// Subscribes to every entry appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.tap.subscribe()
    }

    /// Appends one entry, in a total order consistent with the action's observable
    /// effect (design §5: tool_call before its tool_result).
    pub async fn append(
        &self,
        trace_id: impl Into<String>,
        action_type: ActionType,
        payload: serde_json::Value,
        status: AuditStatus,
    ) -> Result<AuditEntry, GatewayError> {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            action_type,
            payload,
            status,
            created_at: Utc::now().timestamp_millis(),
        };
        let db_path = self.db_path.clone();
        let to_store = entry.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute(
                "INSERT INTO audit_log (id, trace_id, action_type, payload, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    to_store.id,
                    to_store.trace_id,
                    to_store.action_type.as_str(),
                    to_store.payload.to_string(),
                    to_store.status.as_str(),
                    to_store.created_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;

        // Broadcasting never blocks the writer (design §4.1); a lagging/absent
        // subscriber is not an append failure.
        let _ = self.tap.send(entry.clone());
        Ok(entry)
    }

    /// All entries sharing a trace id, in insertion order. Used to verify the
    /// "at most one tool_result per tool_call" invariant (design §8.1).
    pub async fn by_trace(&self, trace_id: &str) -> Result<Vec<AuditEntry>, GatewayError> {
        let db_path = self.db_path.clone();
        let trace_id = trace_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<AuditEntry>, GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, action_type, payload, status, created_at FROM audit_log WHERE trace_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![trace_id], row_to_entry)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    pub async fn all(&self) -> Result<Vec<AuditEntry>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<AuditEntry>, GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, action_type, payload, status, created_at FROM audit_log ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    let action_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let payload: String = row.get(3)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        action_type: ActionType::from_str(&action_type).unwrap_or(ActionType::Error),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: AuditStatus::from_str(&status).unwrap_or(AuditStatus::Error),
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_back_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.db")).unwrap();

        log.append("t1", ActionType::ToolCall, serde_json::json!({"n":1}), AuditStatus::Pending)
            .await
            .unwrap();
        log.append("t1", ActionType::ToolResult, serde_json::json!({"n":2}), AuditStatus::Success)
            .await
            .unwrap();

        let entries = log.by_trace("t1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action_type, ActionType::ToolCall);
        assert_eq!(entries[1].action_type, ActionType::ToolResult);
    }

    #[tokio::test]
    async fn subscribers_receive_appended_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.db")).unwrap();
        let mut rx = log.subscribe();

        log.append("t1", ActionType::CronTick, serde_json::json!({}), AuditStatus::Success)
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.trace_id, "t1");
    }

    #[test]
    fn status_delta_is_bounded_to_200_chars() {
        let entry = AuditEntry {
            id: "x".into(),
            trace_id: "t".into(),
            action_type: ActionType::Error,
            payload: serde_json::json!({"msg": "a".repeat(500)}),
            status: AuditStatus::Error,
            created_at: 0,
        };
        assert!(entry.as_status_delta().chars().count() <= 200);
    }
}
