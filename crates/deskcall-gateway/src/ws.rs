//! WebSocket endpoint: one socket per browser tab, JSON text frames.
//!
//! The first event on a socket must be `join_support_chat`; everything
//! before that is rejected. After the join the socket is bound to a user
//! and a per-connection outbox, and a writer task drains the outbox into
//! the sink so the read side never blocks on a slow peer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use deskcall_common::protocol::MAX_TEXT_FRAME_BYTES;
use deskcall_common::WireEvent;

use crate::registry::SessionRegistry;

const OUTBOX_CAPACITY: usize = 64;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_TEXT_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<WireEvent>(OUTBOX_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode outbound event: {err}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Bound after a successful join.
    let mut bound: Option<(String, u64)> = None;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // ping/pong handled by axum
        };
        let event: WireEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(err) => {
                debug!("discarding malformed frame: {err}");
                send_error(&outbox, format!("malformed event: {err}")).await;
                continue;
            }
        };
        if let Some(violation) = event.payload_violation() {
            warn!(kind = event.kind(), "oversized payload: {violation}");
            send_error(&outbox, violation.to_string()).await;
            continue;
        }

        match event {
            WireEvent::JoinSupportChat {
                user_id,
                user_name,
                role,
            } => match &bound {
                // Idempotent rejoin on the same socket.
                Some((bound_user, _)) => registry.resend_sessions(bound_user),
                None => {
                    let conn = registry.join(&user_id, &user_name, role, outbox.clone());
                    info!(user = %user_id, conn, "socket bound");
                    bound = Some((user_id, conn));
                }
            },
            event => match &bound {
                Some((user_id, _)) => {
                    if let Err(err) = registry.relay(user_id, event) {
                        send_error(&outbox, err.to_string()).await;
                    }
                }
                None => {
                    debug!(kind = event.kind(), "event before join");
                    send_error(&outbox, "join_support_chat required first".to_string()).await;
                }
            },
        }
    }

    if let Some((user_id, conn)) = bound {
        registry.connection_closed(&user_id, conn);
    }
    writer.abort();
}

async fn send_error(outbox: &mpsc::Sender<WireEvent>, message: String) {
    let _ = outbox.send(WireEvent::Error { message }).await;
}
