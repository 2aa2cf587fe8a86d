//! Token usage ledger (design §3 Token Usage Record, §4.1 token-update broadcast).
//!
//! Same persistence shape as [`crate::audit::AuditLog`]: a `PathBuf`-holding store,
//! `spawn_blocking`-wrapped connections, plus a broadcast tap so the transport layer can
//! push `token_update` frames live instead of polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::GatewayError;

/// One model call's token accounting, recorded after every router dispatch
/// (design §4.1 step 6, whether the call succeeded or failed).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: String,
    pub model_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub created_at: i64,
}

impl TokenUsageRecord {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Rolling totals for one model, as broadcast in a `token_update` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelUsageSummary {
    pub model_id: String,
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub struct TokenMeter {
    db_path: PathBuf,
    tap: broadcast::Sender<ModelUsageSummary>,
}

impl TokenMeter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS token_usage (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        let (tap, _) = broadcast::channel(256);
        Ok(Self { db_path, tap })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelUsageSummary> {
        self.tap.subscribe()
    }

    /// Records one call's usage and broadcasts the model's updated rolling total.
    pub async fn record(
        &self,
        model_id: impl Into<String>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<TokenUsageRecord, GatewayError> {
        let model_id = model_id.into();
        let record = TokenUsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.clone(),
            prompt_tokens,
            completion_tokens,
            created_at: Utc::now().timestamp_millis(),
        };
        let db_path = self.db_path.clone();
        let to_store = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute(
                "INSERT INTO token_usage (id, model_id, prompt_tokens, completion_tokens, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    to_store.id,
                    to_store.model_id,
                    to_store.prompt_tokens,
                    to_store.completion_tokens,
                    to_store.created_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;

        if let Ok(summary) = self.summary_for(&model_id).await {
            let _ = self.tap.send(summary);
        }
        Ok(record)
    }

    pub async fn summary_for(&self, model_id: &str) -> Result<ModelUsageSummary, GatewayError> {
        let db_path = self.db_path.clone();
        let model_id = model_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<ModelUsageSummary, GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens),0), COALESCE(SUM(completion_tokens),0) FROM token_usage WHERE model_id = ?1",
            )?;
            let (calls, prompt, completion): (i64, i64, i64) =
                stmt.query_row(params![model_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            Ok(ModelUsageSummary {
                model_id,
                calls: calls as u64,
                prompt_tokens: prompt as u64,
                completion_tokens: completion as u64,
                total_tokens: (prompt + completion) as u64,
            })
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    /// Rolling totals across every model seen so far.
    pub async fn all_summaries(&self) -> Result<HashMap<String, ModelUsageSummary>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, ModelUsageSummary>, GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT model_id, COUNT(*), COALESCE(SUM(prompt_tokens),0), COALESCE(SUM(completion_tokens),0) FROM token_usage GROUP BY model_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let model_id: String = row.get(0)?;
                let calls: i64 = row.get(1)?;
                let prompt: i64 = row.get(2)?;
                let completion: i64 = row.get(3)?;
                Ok((
                    model_id.clone(),
                    ModelUsageSummary {
                        model_id,
                        calls: calls as u64,
                        prompt_tokens: prompt as u64,
                        completion_tokens: completion as u64,
                        total_tokens: (prompt + completion) as u64,
                    },
                ))
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let (k, v) = row?;
                out.insert(k, v);
            }
            Ok(out)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_accumulates_rolling_total() {
        let dir = tempfile::tempdir().unwrap();
        let meter = TokenMeter::new(dir.path().join("tokens.db")).unwrap();

        meter.record("gpt-4o", 100, 50).await.unwrap();
        meter.record("gpt-4o", 20, 10).await.unwrap();

        let summary = meter.summary_for("gpt-4o").await.unwrap();
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.prompt_tokens, 120);
        assert_eq!(summary.completion_tokens, 60);
        assert_eq!(summary.total_tokens, 180);
    }

    #[tokio::test]
    async fn broadcast_tap_emits_updated_summary() {
        let dir = tempfile::tempdir().unwrap();
        let meter = TokenMeter::new(dir.path().join("tokens.db")).unwrap();
        let mut rx = meter.subscribe();

        meter.record("claude-3", 5, 5).await.unwrap();
        let summary = rx.recv().await.unwrap();
        assert_eq!(summary.model_id, "claude-3");
        assert_eq!(summary.total_tokens, 10);
    }

    #[tokio::test]
    async fn all_summaries_covers_every_model_seen() {
        let dir = tempfile::tempdir().unwrap();
        let meter = TokenMeter::new(dir.path().join("tokens.db")).unwrap();
        meter.record("a", 1, 1).await.unwrap();
        meter.record("b", 2, 2).await.unwrap();

        let all = meter.all_summaries().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].total_tokens, 2);
        assert_eq!(all["b"].total_tokens, 4);
    }
}
