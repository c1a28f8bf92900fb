use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use llmlink_broker::BrokerEvent;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

use crate::api::AppState;

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Push-only channel: one `status_update` snapshot on connect, then broker
/// events as they happen and `metrics_update` on a fixed period. Client
/// frames other than close are ignored.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.broker.subscribe();
    let mut metrics_tick = tokio::time::interval(state.metrics_interval);
    metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the snapshot below covers it.
    metrics_tick.tick().await;

    let snapshot = frame("status_update", json!({ "status": state.broker.status() }));
    if ws_tx.send(snapshot).await.is_err() {
        return;
    }

    loop {
        let outgoing = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = metrics_tick.tick() => {
                frame("metrics_update", json!(state.broker.metrics_snapshot()))
            }
            event = events.recv() => match event {
                Ok(event) => event_frame(&state, event),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "ws client lagged behind broker events");
                    frame("status_update", json!({ "status": state.broker.status() }))
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(e)) => {
                    tracing::debug!("ws read error: {e}");
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };
        if ws_tx.send(outgoing).await.is_err() {
            break;
        }
    }
    tracing::debug!("ws connection closed");
}

fn event_frame(state: &AppState, event: BrokerEvent) -> Message {
    match event {
        BrokerEvent::StatusChanged {
            kind,
            previous,
            current,
            health,
        } => frame(
            "status_update",
            json!({
                "kind": kind,
                "previous": previous,
                "current": current,
                "health": health,
                "status": state.broker.status(),
            }),
        ),
        BrokerEvent::ModelsChanged { kind, models } => {
            frame("model_update", json!({ "kind": kind, "models": models }))
        }
    }
}

fn frame(kind: &str, data: Value) -> Message {
    let text = json!({
        "type": kind,
        "data": data,
        "timestamp": Utc::now(),
    });
    Message::text(text.to_string())
}
