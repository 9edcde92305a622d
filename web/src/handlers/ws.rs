//! Device and operator WebSocket endpoints, bound to the Session Hub
//! (spec.md §4.6, §6 `/ws`, `/ws/ui`).
//!
//! Grounded in the donor's topic-based handler
//! (`handlers/websocket_topics.rs`): split socket, one task streaming
//! published events out, one task draining client frames, `select!` on
//! whichever finishes first. Generalized here to the two fixed
//! [`SubscriberClass`]es the Session Hub fans out to instead of
//! arbitrary string topics.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::middleware::{DeviceAuth, DeviceIdentity, OperatorGuard};
use crate::state::AppState;
use pclink_core::config::WS_IDLE_TIMEOUT;
use pclink_core::hub::{EventEnvelope, SubscriberClass};

/// `GET /ws`: device-side event stream. Opening this socket is the
/// presence signal a device is online (spec.md §4.6: "WS presence is
/// authoritative, not HTTP traffic").
pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    DeviceAuth(identity): DeviceAuth,
) -> Response {
    let owner_id = match identity {
        DeviceIdentity::Device(id) => id,
        DeviceIdentity::Server => Uuid::nil(),
    };
    ws.on_upgrade(move |socket| run(socket, state, SubscriberClass::Device, owner_id))
}

/// `GET /ws/ui`: operator-side event stream, carrying `pairing_request`,
/// `device_connected`, `device_disconnected`, and transfer progress
/// events (spec.md §4.6).
pub async fn operator_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    OperatorGuard(session): OperatorGuard,
) -> Response {
    let _ = &session;
    ws.on_upgrade(move |socket| run(socket, state, SubscriberClass::Operator, Uuid::nil()))
}

async fn run(socket: WebSocket, state: AppState, class: SubscriberClass, owner_id: Uuid) {
    let (key, mut rx) = state.hub.subscribe(class, owner_id).await;

    if matches!(class, SubscriberClass::Device) {
        publish_presence(&state, "device_connected", owner_id).await;
    }

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(WS_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Ok(event)) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        return;
                    }
                },
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "websocket subscriber lagged, closing connection");
                    return;
                },
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return,
                Err(_elapsed) => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                },
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Binary(_) => {},
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(class, key).await;
    if matches!(class, SubscriberClass::Device) {
        publish_presence(&state, "device_disconnected", owner_id).await;
    }
}

async fn publish_presence(state: &AppState, event_type: &str, device_id: Uuid) {
    state
        .hub
        .publish(
            SubscriberClass::Operator,
            EventEnvelope::new(event_type, serde_json::json!({"device_id": device_id})),
        )
        .await;
}

