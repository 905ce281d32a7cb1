use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::broadcast::{self, send_server_message};
use super::messages::{ClientMessage, ServerMessage};
use super::signal::{self, SessionState};
use crate::errors::SignalError;
use crate::media::transport::media_kind_as_str;
use crate::AppState;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
// RTP capability payloads are chunky, but nowhere near this.
pub const MAX_SIGNAL_PAYLOAD_BYTES: usize = 256 * 1024;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let forwarder = broadcast::spawn_event_forwarder(
        connection_id,
        state.registry.subscribe(),
        out_tx.clone(),
        state.telemetry.clone(),
    );

    tracing::debug!(connection_id = %connection_id, "signaling channel opened");
    let mut session = SessionState::new(connection_id);

    // Requests are handled strictly in arrival order; a request never
    // observes a partial effect of its predecessor.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if text.len() > MAX_SIGNAL_PAYLOAD_BYTES {
                    state.telemetry.inc_signal_error();
                    send_server_message(
                        &out_tx,
                        ServerMessage::Error {
                            request_id: None,
                            error: SignalError::ProtocolOrder.kind(),
                            message: Some("Signaling payload too large".into()),
                        },
                    );
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(request) => {
                        signal::handle_request(&state, &mut session, request, &out_tx).await;
                    }
                    Err(error) => {
                        state.telemetry.inc_signal_error();
                        send_server_message(
                            &out_tx,
                            ServerMessage::Error {
                                request_id: None,
                                error: SignalError::ProtocolOrder.kind(),
                                message: Some(format!("Invalid signaling payload: {error}")),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Close cascade: producers (and their egress bindings) go first, then
    // the device flips to disconnected and its grace window starts.
    let closed = state
        .media
        .cleanup_connection(connection_id, &state.registry)
        .await;
    for producer in &closed {
        tracing::debug!(
            connection_id = %connection_id,
            producer_id = %producer.producer_id,
            device_id = %producer.device_id,
            kind = media_kind_as_str(producer.kind),
            "producer closed with session"
        );
    }
    if session.device_id.is_some() {
        state.registry.mark_disconnected(connection_id);
    }

    forwarder.abort();
    writer.abort();
    tracing::debug!(connection_id = %connection_id, "signaling channel closed");
}
