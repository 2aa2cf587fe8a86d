//! Session registry for the Transport & Session Layer (design §4.1), transport-agnostic:
//! this module knows nothing about WebSockets or axum, only about named channels that
//! frames can be pushed into. The axum binding lives in a separate adapter crate that
//! drains each [`Session`]'s outbound channel onto a real socket.

use std::sync::Arc;

use dashmap::DashMap;
use gateway_wire::{Channel, ErrorCode, Frame};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("first frame on a connection must be connect")]
    Protocol,
    #[error("no active session: {0}")]
    NoSession(String),
}

/// One live connection's outbound half. `send` is best-effort: a closed receiver is
/// not an error, per design §4.1 ("drops silently if the socket has closed").
pub struct Session {
    pub id: String,
    pub channel: Channel,
    outbound: mpsc::Sender<Frame>,
}

impl Session {
    pub fn send(&self, frame: Frame) {
        let _ = self.outbound.try_send(frame);
    }
}

/// Registry of live sessions keyed by session id, an arena the same way the agent
/// graph and cooldown table are (design §9 arena-by-id discipline).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `open(channel, desiredSessionId?)`: registers a new session and returns its
    /// outbound receiver for the adapter to drain onto the real socket.
    pub fn open(&self, channel: Channel, desired_id: Option<String>) -> (Arc<Session>, mpsc::Receiver<Frame>) {
        let id = desired_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(256);
        let session = Arc::new(Session {
            id: id.clone(),
            channel,
            outbound: tx,
        });
        self.sessions.insert(id, session.clone());
        (session, rx)
    }

    /// `send(sessionId, frame)`: best-effort targeted delivery.
    pub fn send(&self, session_id: &str, frame: Frame) -> Result<(), TransportError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| TransportError::NoSession(session_id.to_string()))?;
        session.send(frame);
        Ok(())
    }

    /// `broadcast(frame)`: delivers to every live connection whose socket is writable.
    pub fn broadcast(&self, frame: Frame) {
        for entry in self.sessions.iter() {
            entry.value().send(frame.clone());
        }
    }

    /// `close(sessionId, reason)`: removes from registry; callers emit
    /// `client_disconnected` themselves once the socket is actually torn down.
    pub fn close(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Builds the `error` frame for a frame that failed to parse (design §4.1).
pub fn invalid_frame_error(message: impl Into<String>) -> Frame {
    Frame::error(ErrorCode::InvalidFrame, message, None)
}

/// Builds the `error` frame for a non-`connect` frame sent before a session exists.
pub fn no_session_error() -> Frame {
    Frame::error(ErrorCode::NoSession, "no active session", None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_registers_and_returns_a_receiver() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.open(Channel::Chat, None);
        assert!(registry.is_open(&session.id));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn send_to_unknown_session_errors() {
        let registry = SessionRegistry::new();
        let err = registry.send("missing", Frame::error(ErrorCode::NoSession, "x", None)).unwrap_err();
        assert_eq!(err, TransportError::NoSession("missing".to_string()));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_session() {
        let registry = SessionRegistry::new();
        let (_s1, mut rx1) = registry.open(Channel::Chat, None);
        let (_s2, mut rx2) = registry.open(Channel::Dashboard, None);

        registry.broadcast(Frame::error(ErrorCode::Fatal, "boom", None));

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn close_removes_from_registry() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.open(Channel::Chat, None);
        assert!(registry.close(&session.id));
        assert!(!registry.is_open(&session.id));
    }
}
