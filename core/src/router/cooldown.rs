//! Per-model cooldown tracking (design §3 Cooldown State, §4.3 backoff math).
//!
//! A `dashmap`-backed table, matching the teacher's copy-on-read concurrency style:
//! readers take a snapshot, writers go through the table's own API, and an expired
//! entry is deleted the moment a read observes it (design §5: "reads that observe
//! expiry delete the entry").

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use super::{ProviderError, RouterErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownReason {
    RateLimited,
    QuotaExceeded,
    ServerError,
    AuthFailure,
    Timeout,
}

#[derive(Clone, Debug)]
pub struct CooldownState {
    pub started_at_ms: u64,
    pub expires_at_ms: u64,
    pub reason: CooldownReason,
    pub message: Option<String>,
    pub failure_count: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub struct CooldownTable {
    entries: DashMap<String, CooldownState>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// True if the model is currently cooling down; deletes the entry if it has expired.
    pub fn is_cooling(&self, model_id: &str) -> bool {
        let expired = match self.entries.get(model_id) {
            Some(state) => now_ms() >= state.expires_at_ms,
            None => return false,
        };
        if expired {
            self.entries.remove(model_id);
            false
        } else {
            true
        }
    }

    pub fn clear(&self, model_id: &str) {
        self.entries.remove(model_id);
    }

    /// A snapshot of every currently tracked cooldown, for `getModelRuntimeStatuses()`
    /// (design §4.3: "cooldowns and their reasons are externally observable").
    pub fn snapshot(&self) -> Vec<(String, CooldownState)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Sets or extends a cooldown from a classified provider error. TTL is header-derived
    /// when present, else `default_ms`; repeated failures apply an exponential multiplier
    /// capped at x5 (design §4.3).
    pub fn set_from_error(&self, model_id: &str, err: &ProviderError, default_ms: u64) {
        let reason = match err.kind {
            RouterErrorKind::RateLimited => CooldownReason::RateLimited,
            RouterErrorKind::QuotaExceeded => CooldownReason::QuotaExceeded,
            RouterErrorKind::ServerError => CooldownReason::ServerError,
            RouterErrorKind::AuthFailure => CooldownReason::AuthFailure,
            RouterErrorKind::Timeout => CooldownReason::Timeout,
            _ => CooldownReason::ServerError,
        };
        let failure_count = self
            .entries
            .get(model_id)
            .map(|s| s.failure_count + 1)
            .unwrap_or(1);
        let multiplier = failure_count.min(5) as u64;
        let base = err.retry_after_ms.unwrap_or(default_ms);
        let ttl = base.saturating_mul(multiplier.max(1)).min(base.saturating_mul(5).max(base));
        let started = now_ms();
        self.entries.insert(
            model_id.to_string(),
            CooldownState {
                started_at_ms: started,
                expires_at_ms: started + ttl,
                reason,
                message: Some(err.message.clone()),
                failure_count,
            },
        );
    }
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_model_is_not_cooling() {
        let table = CooldownTable::new();
        assert!(!table.is_cooling("openai/gpt-4o"));
    }

    #[test]
    fn set_from_error_marks_model_cooling() {
        let table = CooldownTable::new();
        table.set_from_error(
            "openai/gpt-4o",
            &ProviderError {
                kind: RouterErrorKind::RateLimited,
                message: "429".into(),
                retry_after_ms: Some(10_000),
            },
            60_000,
        );
        assert!(table.is_cooling("openai/gpt-4o"));
    }

    #[test]
    fn expired_cooldown_is_evicted_on_read() {
        let table = CooldownTable::new();
        table.set_from_error(
            "openai/gpt-4o",
            &ProviderError {
                kind: RouterErrorKind::RateLimited,
                message: "429".into(),
                retry_after_ms: Some(0),
            },
            60_000,
        );
        assert!(!table.is_cooling("openai/gpt-4o"));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn repeated_failures_scale_ttl_up_to_five_x() {
        let table = CooldownTable::new();
        let err = ProviderError {
            kind: RouterErrorKind::RateLimited,
            message: "429".into(),
            retry_after_ms: Some(1_000),
        };
        for _ in 0..10 {
            table.set_from_error("m", &err, 60_000);
        }
        let snapshot = table.snapshot();
        let (_, state) = &snapshot[0];
        assert_eq!(state.failure_count, 10);
        assert!(state.expires_at_ms - state.started_at_ms <= 5_000);
    }
}
