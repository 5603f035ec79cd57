//! WebSocket endpoints streaming live log events.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use mockgate_core::LogHub;
use mockgate_core::hub::Subscriber;

use crate::state::AppState;

/// Hub subscriber over one WebSocket's sending half.
///
/// The sink sits behind a mutex so the hub can deliver from its fan-out
/// task while the connection task keeps the receiving half.
struct WsSubscriber {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl Subscriber for WsSubscriber {
    async fn deliver(&self, frame: &str) -> Result<(), String> {
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| format!("websocket send failed: {e}"))
    }
}

/// `GET /ws/logs`: every log event.
pub async fn ws_logs_all(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone(), None))
}

/// `GET /ws/logs/{service_id}`: events of one service only.
pub async fn ws_logs_service(
    ws: WebSocketUpgrade,
    Path(service_id): Path<u64>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone(), Some(service_id)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<LogHub>, service_id: Option<u64>) {
    let (sender, mut receiver) = socket.split();
    let subscriber = Arc::new(WsSubscriber {
        sender: Mutex::new(sender),
    });
    let connection = hub.subscribe(subscriber, service_id);
    debug!(connection, ?service_id, "log subscriber connected");

    // Clients may send frames (heartbeats, anything); they are read and
    // discarded. A receive error or a close frame is the disconnect signal.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.unsubscribe(connection, service_id);
    debug!(connection, ?service_id, "log subscriber disconnected");
}
