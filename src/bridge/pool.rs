use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::envelope::ClientFrame;

/// Channel sender half for pushing frames to one client.
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// One connected client.
pub struct ClientHandle {
    pub sender: ClientSender,
    pub connected_at: DateTime<Utc>,
}

/// Live set of client connections on this bridge instance.
///
/// Clients are added on connect and removed on close. Broadcasts go to a
/// snapshot of the senders, so a client closing mid-broadcast only loses
/// its own copy.
pub struct ClientPool {
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a client and return the receiver its writer task drains.
    pub async fn add(&self, client_id: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            sender: tx,
            connected_at: Utc::now(),
        };
        self.clients.write().await.insert(client_id, handle);
        rx
    }

    pub async fn remove(&self, client_id: &str) {
        if let Some(handle) = self.clients.write().await.remove(client_id) {
            let connected_for = Utc::now() - handle.connected_at;
            debug!(
                client_id = %client_id,
                connected_secs = connected_for.num_seconds(),
                "Client removed from pool"
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Send `frame` to every connected client. Returns how many accepted it.
    pub async fn broadcast(&self, frame: &ClientFrame) -> usize {
        let text = frame.to_json();
        let senders: Vec<ClientSender> = self
            .clients
            .read()
            .await
            .values()
            .map(|handle| handle.sender.clone())
            .collect();

        senders
            .iter()
            .filter(|sender| sender.send(Message::Text(text.clone().into())).is_ok())
            .count()
    }

    /// Ping every client. Driven by the heartbeat task.
    pub async fn ping_all(&self) {
        let clients = self.clients.read().await;
        for handle in clients.values() {
            let _ = handle.sender.send(Message::Ping(Bytes::new()));
        }
    }

    /// Send a close frame to every client and forget them.
    pub async fn shutdown_all(&self) {
        let mut clients = self.clients.write().await;
        let count = clients.len();
        for handle in clients.values() {
            let _ = handle.sender.send(Message::Close(None));
        }
        clients.clear();
        info!(count, "Closed all client connections");
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}
