//! Axum/WebSocket binding for the gateway wire protocol (design §4.1 ambient note).
//!
//! Transport-agnostic demultiplexing lives in `gateway_core::transport`; this crate
//! is the thin adapter on top, in the spirit of the teacher's `serve` crate, exposing
//! [`run_gateway`] / [`run_gateway_on_listener`] with a `once` test mode.

mod app;
mod connection;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::audit::AuditLog;
use gateway_core::token_meter::TokenMeter;
use gateway_core::transport::SessionRegistry;
use gateway_wire::{Frame, StreamType, SENTINEL_SESSION_ID};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use app::{router, AppState};

const DEFAULT_WS_ADDR: &str = "127.0.0.1:8080";

/// Callbacks the adapter invokes once a frame has been demultiplexed to a session.
/// Kept separate from the concrete runtime so this crate never depends on the
/// scheduler/swarm/router internals directly (design §4.1: "demultiplex frames to
/// the runtime" names a responsibility, not a concrete dependency).
#[async_trait]
pub trait GatewayHandler: Send + Sync {
    async fn on_message(&self, session_id: String, content: String, metadata: Option<Value>);
    async fn on_approval_response(&self, id: String, approved: bool);
    async fn on_input_response(&self, id: String, value: String);
}

/// A handler that does nothing; useful for smoke-testing the transport layer
/// in isolation from the runtime.
pub struct NullHandler;

#[async_trait]
impl GatewayHandler for NullHandler {
    async fn on_message(&self, _session_id: String, _content: String, _metadata: Option<Value>) {}
    async fn on_approval_response(&self, _id: String, _approved: bool) {}
    async fn on_input_response(&self, _id: String, _value: String) {}
}

/// Bridges the audit log's broadcast tap onto the session registry as `stream`
/// frames with `streamType: status` (design §4.1).
pub fn spawn_audit_bridge(audit: Arc<AuditLog>, sessions: Arc<SessionRegistry>) {
    let mut rx = audit.subscribe();
    tokio::spawn(async move {
        while let Ok(entry) = rx.recv().await {
            let frame = Frame::Stream {
                session_id: SENTINEL_SESSION_ID.to_string(),
                trace_id: entry.trace_id.clone(),
                stream_type: StreamType::Status,
                delta: entry.as_status_delta(),
                metadata: None,
            };
            sessions.broadcast(frame);
        }
    });
}

/// Bridges the token meter's broadcast tap onto the session registry as
/// `token_update` frames (design §4.1).
pub fn spawn_token_bridge(meter: Arc<TokenMeter>, sessions: Arc<SessionRegistry>) {
    let mut rx = meter.subscribe();
    tokio::spawn(async move {
        while let Ok(summary) = rx.recv().await {
            let frame = Frame::TokenUpdate {
                model_id: summary.model_id,
                role: String::new(),
                prompt_tokens: summary.prompt_tokens as u32,
                completion_tokens: summary.completion_tokens as u32,
                total_tokens: summary.total_tokens as u32,
                estimated_cost: 0.0,
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            sessions.broadcast(frame);
        }
    });
}

/// Runs the server on an existing listener. Used by tests (bind to 127.0.0.1:0,
/// then pass the listener in). When `once` is true, accepts one connection,
/// handles it to completion, then returns.
pub async fn run_gateway_on_listener(
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
    handler: Arc<dyn GatewayHandler>,
    once: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!(%addr, "gateway transport listening");
    if once {
        info!("will exit after first connection completes (once mode, used by tests)");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let state = Arc::new(AppState {
        shutdown_tx: Mutex::new(if once { Some(shutdown_tx) } else { None }),
        sessions,
        handler,
    });

    let app = router(state);

    if once {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await?;
        info!("connection done, exiting (once mode)");
    } else {
        axum::serve(listener, app).await?;
    }
    Ok(())
}

/// Runs the server, binding `addr` (default `127.0.0.1:8080`).
pub async fn run_gateway(
    addr: Option<&str>,
    sessions: Arc<SessionRegistry>,
    handler: Arc<dyn GatewayHandler>,
    once: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_WS_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_gateway_on_listener(listener, sessions, handler, once).await
}

/// Re-exported so binaries that build a `connect` frame by hand don't need a
/// direct `gateway-wire` dependency just for this one type.
pub use gateway_wire::Channel as GatewayChannel;
