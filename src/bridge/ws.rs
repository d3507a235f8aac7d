//! WebSocket transport for bridge clients.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace};

use super::Bridge;

/// Interval between heartbeat pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Routes accepting WebSocket upgrades on any path.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .fallback(ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

async fn ws_handler(ws: WebSocketUpgrade, State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

/// Drive one client connection until it closes.
///
/// Outbound frames flow from the pool through a spawned writer task;
/// inbound text frames go to the client's session.
async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, "Client connected");

    let mut rx = bridge.pool().add(client_id.clone()).await;
    let mut session = bridge.session(client_id.clone());
    let (mut sink, mut stream) = socket.split();

    let writer_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                debug!(client_id = %writer_id, "Client sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => session.on_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => trace!(client_id = %client_id, "Pong received"),
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Client receive error");
                break;
            }
        }
    }

    bridge.pool().remove(&client_id).await;
    session.on_close().await;
    send_task.abort();
    info!(client_id = %client_id, "Client disconnected");
}

/// Ping every client on an interval until aborted.
pub fn start_heartbeat(bridge: Arc<Bridge>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            let count = bridge.pool().connection_count().await;
            debug!(count, "Client heartbeat ping");
            bridge.pool().ping_all().await;
        }
    })
}
