//! Approval / Input Gate: request/response rendezvous between long-running runtime
//! code and an external decider (design §4.6).
//!
//! The gate never mutates runtime state directly — callers branch on the returned
//! value. Built on `tokio::sync::oneshot`, the same "allocate an id, stash a
//! resolver, fulfill it later" shape the teacher uses for its approval waiters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// One pending approval: a boolean decision, default `false` on expiry.
struct PendingApproval {
    resolver: oneshot::Sender<bool>,
}

/// One pending input request: a string decision.
struct PendingInput {
    resolver: oneshot::Sender<String>,
}

const APPROVAL_EXPIRY: Duration = Duration::from_secs(60);
const INPUT_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// `APPROVAL_EXPIRY` in milliseconds, for callers building the `expires_at` field of
/// an `approval_request` frame (design §4.6) without duplicating the constant.
pub fn approval_expiry_ms() -> i64 {
    APPROVAL_EXPIRY.as_millis() as i64
}

/// Rendezvous table for `requestApproval`/`resolveApproval` (design §4.6).
#[derive(Default)]
pub struct ApprovalGate {
    pending: DashMap<String, PendingApproval>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id, broadcasts nothing itself (the caller does that with the
    /// returned id), and waits up to 60s for a resolution; times out to `false`.
    pub async fn request(&self, id: String) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), PendingApproval { resolver: tx });
        let result = timeout(APPROVAL_EXPIRY, rx).await;
        self.pending.remove(&id);
        match result {
            Ok(Ok(approved)) => approved,
            _ => false,
        }
    }

    /// Fulfills a pending approval. Returns `false` if the id is unknown or already
    /// resolved/expired, letting callers detect staleness (design §4.6 contracts).
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => pending.resolver.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

/// Rendezvous table for `requestInput`/`resolveInput` (design §4.6).
#[derive(Default)]
pub struct InputGate {
    pending: DashMap<String, PendingInput>,
}

impl InputGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(&self, id: String) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), PendingInput { resolver: tx });
        let result = timeout(INPUT_EXPIRY, rx).await;
        self.pending.remove(&id);
        match result {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn resolve(&self, id: &str, value: String) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => pending.resolver.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approval_resolved_before_expiry_returns_decision() {
        let gate = Arc::new(ApprovalGate::new());
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move { gate2.request("a1".to_string()).await });

        tokio::task::yield_now().await;
        assert!(gate.resolve("a1", true));

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn late_resolution_returns_false() {
        let gate = ApprovalGate::new();
        assert!(!gate.resolve("unknown", true));
    }

    #[tokio::test]
    async fn a_given_id_is_fulfilled_at_most_once() {
        let gate = Arc::new(ApprovalGate::new());
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move { gate2.request("a1".to_string()).await });
        tokio::task::yield_now().await;

        assert!(gate.resolve("a1", true));
        assert!(!gate.resolve("a1", false));
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn input_request_resolves_with_string() {
        let gate = Arc::new(InputGate::new());
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move { gate2.request("i1".to_string()).await });
        tokio::task::yield_now().await;

        assert!(gate.resolve("i1", "hello".to_string()));
        assert_eq!(handle.await.unwrap(), Some("hello".to_string()));
    }
}
