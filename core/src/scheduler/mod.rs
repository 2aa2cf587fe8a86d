//! Scheduler: runs periodic work in-process without overlap (design §4.5).
//!
//! Jobs are persisted by name (SQLite, same `spawn_blocking`-per-operation shape as
//! [`crate::audit::AuditLog`]) and reloaded on process restart. Cron expressions are
//! parsed and their next fire time computed with the `cron` crate.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Error,
    Skipped,
    Pending,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job is currently running: {0}")]
    AlreadyRunning(String),
    #[error(transparent)]
    Storage(#[from] GatewayError),
}

/// A single scheduled job (design §3 Cron Job / §4.5 operations).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    pub expression: String,
    pub instruction: String,
    pub enabled: bool,
    pub run_once: bool,
    pub timeout_seconds: u64,
    pub running_at_ms: Option<i64>,
    pub last_status: Option<JobStatus>,
    pub consecutive_errors: u32,
    pub next_scheduled_ms: Option<i64>,
}

impl CronJob {
    pub fn new(name: impl Into<String>, expression: impl Into<String>, instruction: impl Into<String>) -> Result<Self, SchedulerError> {
        let expression = expression.into();
        let next = next_fire_after(&expression, Utc::now().timestamp_millis())?;
        Ok(Self {
            name: name.into(),
            expression,
            instruction: instruction.into(),
            enabled: true,
            run_once: false,
            timeout_seconds: 0,
            running_at_ms: None,
            last_status: None,
            consecutive_errors: 0,
            next_scheduled_ms: Some(next),
        })
    }
}

/// Next fire time strictly after `after_ms`, per the configured expression.
fn next_fire_after(expression: &str, after_ms: i64) -> Result<i64, SchedulerError> {
    let schedule = Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;
    let after = chrono::DateTime::<Utc>::from_timestamp_millis(after_ms).unwrap_or_else(Utc::now);
    schedule
        .after(&after)
        .next()
        .map(|t| t.timestamp_millis())
        .ok_or_else(|| SchedulerError::InvalidExpression("expression never fires".to_string()))
}

/// Exponential backoff capped at `base * 32` (design §4.5).
pub fn backoff_delay_ms(base_ms: u64, consecutive_errors: u32) -> u64 {
    if consecutive_errors == 0 {
        return 0;
    }
    let multiplier = 1u64 << (consecutive_errors - 1).min(5);
    (base_ms.saturating_mul(multiplier)).min(base_ms.saturating_mul(32))
}

/// SQLite-backed job store, one row per job name.
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cron_jobs (
                name TEXT PRIMARY KEY,
                expression TEXT NOT NULL,
                instruction TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                run_once INTEGER NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                running_at_ms INTEGER,
                last_status TEXT,
                consecutive_errors INTEGER NOT NULL,
                next_scheduled_ms INTEGER
            )
            "#,
            [],
        )?;
        Ok(Self { db_path })
    }

    pub async fn upsert(&self, job: &CronJob) -> Result<(), GatewayError> {
        let db_path = self.db_path.clone();
        let job = job.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO cron_jobs (name, expression, instruction, enabled, run_once, timeout_seconds, running_at_ms, last_status, consecutive_errors, next_scheduled_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(name) DO UPDATE SET
                    expression = excluded.expression,
                    instruction = excluded.instruction,
                    enabled = excluded.enabled,
                    run_once = excluded.run_once,
                    timeout_seconds = excluded.timeout_seconds,
                    running_at_ms = excluded.running_at_ms,
                    last_status = excluded.last_status,
                    consecutive_errors = excluded.consecutive_errors,
                    next_scheduled_ms = excluded.next_scheduled_ms
                "#,
                params![
                    job.name,
                    job.expression,
                    job.instruction,
                    job.enabled,
                    job.run_once,
                    job.timeout_seconds as i64,
                    job.running_at_ms,
                    job.last_status.map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string()),
                    job.consecutive_errors,
                    job.next_scheduled_ms,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    pub async fn remove(&self, name: &str) -> Result<(), GatewayError> {
        let db_path = self.db_path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute("DELETE FROM cron_jobs WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    pub async fn load_all(&self) -> Result<Vec<CronJob>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<CronJob>, GatewayError> {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT name, expression, instruction, enabled, run_once, timeout_seconds, running_at_ms, last_status, consecutive_errors, next_scheduled_ms FROM cron_jobs",
            )?;
            let rows = stmt.query_map([], |row| {
                let last_status: Option<String> = row.get(7)?;
                Ok(CronJob {
                    name: row.get(0)?,
                    expression: row.get(1)?,
                    instruction: row.get(2)?,
                    enabled: row.get(3)?,
                    run_once: row.get(4)?,
                    timeout_seconds: row.get::<_, i64>(5)? as u64,
                    running_at_ms: row.get(6)?,
                    last_status: last_status.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
                    consecutive_errors: row.get(8)?,
                    next_scheduled_ms: row.get(9)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    /// Loads a single job by name, the basis for every named operation below.
    async fn get(&self, name: &str) -> Result<CronJob, SchedulerError> {
        self.load_all()
            .await?
            .into_iter()
            .find(|j| j.name == name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    /// `triggerJob(name)` (design §4.5): forces an immediate run by bringing the next
    /// fire time forward to now; fails if the job is already mid-run.
    pub async fn trigger_job(&self, name: &str) -> Result<CronJob, SchedulerError> {
        let mut job = self.get(name).await?;
        if job.running_at_ms.is_some() {
            return Err(SchedulerError::AlreadyRunning(name.to_string()));
        }
        job.next_scheduled_ms = Some(Utc::now().timestamp_millis());
        self.upsert(&job).await?;
        Ok(job)
    }

    /// `pauseJob(name)` (design §4.5): clears the next fire time so the tick loop
    /// never picks the job up again; every other field (status history, error count)
    /// is left untouched so `resumeJob` can pick up where it left off.
    pub async fn pause_job(&self, name: &str) -> Result<CronJob, SchedulerError> {
        let mut job = self.get(name).await?;
        job.next_scheduled_ms = None;
        self.upsert(&job).await?;
        Ok(job)
    }

    /// `resumeJob(name)` (design §4.5): resets the error backoff and reschedules from
    /// now, as if the job's error streak never happened.
    pub async fn resume_job(&self, name: &str) -> Result<CronJob, SchedulerError> {
        let mut job = self.get(name).await?;
        job.consecutive_errors = 0;
        job.next_scheduled_ms = Some(next_fire_after(&job.expression, Utc::now().timestamp_millis())?);
        self.upsert(&job).await?;
        Ok(job)
    }

    /// `updateJob(name, patch)` (design §4.5): applies a caller-supplied mutation
    /// (e.g. a new expression/instruction) and re-derives the next fire time if the
    /// expression changed; fails if the job is currently running, same as `triggerJob`.
    pub async fn update_job(&self, name: &str, patch: impl FnOnce(&mut CronJob)) -> Result<CronJob, SchedulerError> {
        let mut job = self.get(name).await?;
        if job.running_at_ms.is_some() {
            return Err(SchedulerError::AlreadyRunning(name.to_string()));
        }
        let previous_expression = job.expression.clone();
        patch(&mut job);
        if job.expression != previous_expression {
            job.next_scheduled_ms = Some(next_fire_after(&job.expression, Utc::now().timestamp_millis())?);
        }
        self.upsert(&job).await?;
        Ok(job)
    }

    /// `getJobStatus(name)` (design §4.5): read-only snapshot of one job.
    pub async fn get_job_status(&self, name: &str) -> Result<CronJob, SchedulerError> {
        self.get(name).await
    }
}

/// Applies the outcome of one executed tick to a job, per the design §4.5 execution
/// protocol. Returns the updated job; does not persist it.
pub fn apply_tick_outcome(mut job: CronJob, base_interval_ms: u64, succeeded: bool) -> CronJob {
    let now = Utc::now().timestamp_millis();
    job.running_at_ms = None;
    if succeeded {
        job.last_status = Some(JobStatus::Success);
        job.consecutive_errors = 0;
        if job.run_once {
            job.enabled = false;
        } else if let Ok(next) = next_fire_after(&job.expression, now) {
            job.next_scheduled_ms = Some(next);
        }
    } else {
        job.last_status = Some(JobStatus::Error);
        job.consecutive_errors += 1;
        let delay = backoff_delay_ms(base_interval_ms, job.consecutive_errors);
        job.next_scheduled_ms = Some(now + delay as i64);
    }
    job
}
