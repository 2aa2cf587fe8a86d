//! WebSocket connection lifecycle: recv loop, frame dispatch, and the writer task
//! that drains a session's outbound queue onto the socket (design §4.1).

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gateway_wire::{ErrorCode, Frame};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::app::AppState;

type Sink = SplitSink<WebSocket, WsMessage>;

pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<AppState>, shutdown_tx: Option<oneshot::Sender<()>>) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let mut session_id: Option<String> = None;
    let mut forward_task: Option<JoinHandle<()>> = None;

    while let Some(res) = stream.next().await {
        let msg = match res {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "read error, closing socket");
                break;
            }
        };
        let text = match &msg {
            WsMessage::Text(t) => t.clone(),
            WsMessage::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame = match Frame::parse(&text) {
            Ok(f) => f,
            Err(e) => {
                let _ = send(&sink, &Frame::error(ErrorCode::InvalidFrame, e.to_string(), None)).await;
                break;
            }
        };

        match (&session_id, frame) {
            (None, Frame::Connect { channel, session_id: desired }) => {
                let (session, mut outbound) = state.sessions.open(channel.clone(), desired);
                session_id = Some(session.id.clone());
                let ack = Frame::Connect {
                    channel,
                    session_id: Some(session.id.clone()),
                };
                if send(&sink, &ack).await.is_err() {
                    break;
                }
                let sink_for_writer = sink.clone();
                forward_task = Some(tokio::spawn(async move {
                    while let Some(frame) = outbound.recv().await {
                        if send(&sink_for_writer, &frame).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            (None, _) => {
                let _ = send(&sink, &Frame::error(ErrorCode::NoSession, "no active session", None)).await;
                break;
            }
            (Some(sid), Frame::Message { content, metadata, .. }) => {
                state.handler.on_message(sid.clone(), content, metadata).await;
            }
            (Some(_), Frame::ApprovalResponse { id, approved }) => {
                state.handler.on_approval_response(id, approved).await;
            }
            (Some(_), Frame::InputResponse { id, value }) => {
                state.handler.on_input_response(id, value).await;
            }
            (Some(_), Frame::Connect { .. }) => {
                // Reconnecting on an already-open socket is a protocol violation; ignore.
            }
            (Some(_), _) => {}
        }
    }

    if let Some(task) = forward_task {
        task.abort();
    }
    if let Some(sid) = session_id {
        state.sessions.close(&sid);
    }
    if let Some(tx) = shutdown_tx {
        let _ = tx.send(());
    }
}

async fn send(sink: &Arc<Mutex<Sink>>, frame: &Frame) -> Result<(), axum::Error> {
    let json = frame.to_json().unwrap_or_else(|_| "{}".to_string());
    let mut guard = sink.lock().await;
    guard.send(WsMessage::Text(json)).await
}
