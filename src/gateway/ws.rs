//! WebSocket transport: bidirectional JSON-RPC frames over one connection.
//!
//! Each inbound frame is handled on its own task; responses are written
//! back through the session's channel in the order results become
//! available — clients correlate by id. Closing the socket removes the
//! session and cancels outstanding frame tasks.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::session::SessionInfo;

use super::AppState;

pub(crate) async fn serve_socket(socket: WebSocket, state: AppState, session: SessionInfo) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    state.sessions.attach_websocket(&session.id, tx.clone()).await;
    info!(session_id = %session.id, "WebSocket connected");

    // Single writer: everything the connection emits funnels through the
    // session's channel, serializing concurrent frame tasks.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Frame tasks die with the connection (or on process shutdown).
    let cancel = state.shutdown.child_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let pipeline = state.pipeline.clone();
                    let session = session.clone();
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            response = pipeline.handle_frame(text.as_str().as_bytes(), &session) => {
                                if let Some(v) = response {
                                    let _ = tx.send(Message::Text(v.to_string().into()));
                                }
                            }
                        }
                    });
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // Binary/Pong ignored
                Some(Err(e)) => {
                    debug!(session_id = %session.id, "WebSocket error: {e}");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    state.sessions.remove(&session.id).await;
    drop(tx);
    let _ = writer.await;
    info!(session_id = %session.id, "WebSocket disconnected");
}
