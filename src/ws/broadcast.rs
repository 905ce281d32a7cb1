use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::messages::ServerMessage;
use crate::events::RegistryEvent;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsEnqueueResult {
    Enqueued,
    QueueFull,
    Closed,
    SerializeFailed,
}

pub fn send_server_message(tx: &mpsc::Sender<String>, msg: ServerMessage) -> WsEnqueueResult {
    let Ok(json) = serde_json::to_string(&msg) else {
        return WsEnqueueResult::SerializeFailed;
    };

    let result = enqueue_payload(tx, json);
    if result == WsEnqueueResult::QueueFull {
        tracing::warn!(
            "Dropped websocket reply because outbound queue is full (slow-consumer policy: drop newest)"
        );
    }
    result
}

fn enqueue_payload(tx: &mpsc::Sender<String>, payload: String) -> WsEnqueueResult {
    match tx.try_send(payload) {
        Ok(()) => WsEnqueueResult::Enqueued,
        Err(TrySendError::Full(_)) => WsEnqueueResult::QueueFull,
        Err(TrySendError::Closed(_)) => WsEnqueueResult::Closed,
    }
}

/// Forwards registry lifecycle events onto one connection's outbound queue
/// until the connection (or the registry) goes away.
pub fn spawn_event_forwarder(
    connection_id: Uuid,
    mut events: broadcast::Receiver<RegistryEvent>,
    out_tx: mpsc::Sender<String>,
    telemetry: std::sync::Arc<Telemetry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    telemetry.inc_ws_queue_pressure();
                    tracing::warn!(
                        connection_id = %connection_id,
                        skipped,
                        "Observer fell behind the event bus"
                    );
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };

            match enqueue_payload(&out_tx, payload) {
                WsEnqueueResult::Enqueued => {}
                WsEnqueueResult::QueueFull => {
                    telemetry.inc_ws_queue_pressure();
                    tracing::warn!(
                        connection_id = %connection_id,
                        "Dropped lifecycle broadcast due to full outbound websocket queue"
                    );
                }
                WsEnqueueResult::Closed => break,
                WsEnqueueResult::SerializeFailed => {}
            }
        }
    })
}
