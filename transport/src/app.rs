//! Axum app: state, router, and WebSocket upgrade handler.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use gateway_core::transport::SessionRegistry;
use tokio::sync::oneshot;

use crate::connection::handle_socket;
use crate::GatewayHandler;

/// When set, the first WebSocket connection to close sends on this to signal
/// server exit (the `once` test mode borrowed from the teacher's `serve` crate).
pub(crate) struct AppState {
    pub(crate) shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) handler: Arc<dyn GatewayHandler>,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let shutdown_tx = state.shutdown_tx.lock().ok().and_then(|mut g| g.take());
    ws.on_upgrade(move |socket| handle_socket(socket, state, shutdown_tx))
}
