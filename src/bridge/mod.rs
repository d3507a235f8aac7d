//! Pub/sub bridge between the broker and connected clients.
//!
//! Each bridge instance owns one exclusive, server-named queue bound to a
//! shared fanout exchange. Client events are never broadcast locally: they
//! are published to the exchange and come back through the queue, so every
//! client on every instance (the sender included) sees the same frame.
//!
//! This module contains:
//! - `Bridge`: exchange setup, inbound relay, outbound publish
//! - `ClientSession`: per-connection state (the joined name)
//! - `ClientPool`: live client connections
//! - WebSocket transport (`ws`)

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryStream, PublishTarget, QueueSpec};
use crate::envelope::{BridgeEvent, DecodeError};

pub mod pool;
pub mod ws;

pub use pool::ClientPool;

/// Exchange used when none is configured.
pub const DEFAULT_EXCHANGE: &str = "websocket";

/// Longest a client event may wait on the broker before it is dropped.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Relays bridge events between the broker and the client pool.
pub struct Bridge {
    exchange: String,
    pool: Arc<ClientPool>,
    publisher: OnceCell<Arc<dyn Broker>>,
    publish_timeout: Duration,
}

impl Bridge {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pool: Arc::new(ClientPool::new()),
            publisher: OnceCell::new(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bound how long a client event may wait on the broker.
    pub fn with_publish_timeout(mut self, limit: Duration) -> Self {
        self.publish_timeout = limit;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Whether client events are currently forwarded to the broker.
    pub fn is_ready(&self) -> bool {
        self.publisher.initialized()
    }

    /// Declare the exchange and this instance's queue, then start consuming.
    ///
    /// The publisher becomes ready once the consumer is in place.
    pub async fn setup(&self, broker: Arc<dyn Broker>) -> Result<DeliveryStream, BrokerError> {
        broker.declare_exchange(&self.exchange).await?;
        let queue = broker.declare_queue(&QueueSpec::exclusive()).await?;
        broker.bind_queue(&queue, &self.exchange).await?;
        let stream = broker.consume(&queue).await?;

        info!(
            exchange = %self.exchange,
            queue = %queue,
            "Bridge bound to fanout exchange with exclusive queue"
        );

        if self.publisher.set(broker).is_err() {
            debug!("Bridge publisher was already set");
        }
        Ok(stream)
    }

    /// Set up and relay until the consumer ends. Always returns an error:
    /// a bridge without its queue cannot do its job.
    pub async fn run(&self, broker: Arc<dyn Broker>) -> Result<(), BrokerError> {
        let mut stream = self.setup(broker).await?;

        while let Some(item) = stream.next().await {
            self.relay(item?).await;
        }

        Err(BrokerError::Consume(format!(
            "Bridge consumer on exchange \"{}\" ended",
            self.exchange
        )))
    }

    /// Broadcast one inbound event and acknowledge it.
    ///
    /// Malformed bodies and unknown event shapes are logged and acked; bridge
    /// traffic is never redelivered.
    pub async fn relay(&self, delivery: Delivery) {
        match BridgeEvent::decode(delivery.body()) {
            Ok(event) => {
                let sent = self.pool.broadcast(&event.to_frame()).await;
                debug!(event = ?event, clients = sent, "Relayed bridge event");
            }
            Err(DecodeError::UnknownShape(value)) => {
                info!(event = %value, "Unknown bridge event type, not broadcast");
            }
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(delivery.body()),
                    "Invalid bridge message"
                );
            }
        }

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to ack bridge message");
        }
    }

    /// Publish a client event onto the exchange.
    ///
    /// Dropped with a warning while the publisher is not ready, on publish
    /// failure, and when the broker does not answer within the publish
    /// timeout. Returns whether the event was published.
    pub async fn publish(&self, event: &BridgeEvent) -> bool {
        let Some(broker) = self.publisher.get() else {
            warn!(event = ?event, "Bridge publisher not ready, dropping client event");
            return false;
        };

        let body = match event.encode() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to encode client event");
                return false;
            }
        };

        let target = PublishTarget::Exchange(self.exchange.clone());
        match tokio::time::timeout(self.publish_timeout, broker.publish(&target, &body)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(event = ?event, error = %e, "Failed to publish client event, dropping");
                false
            }
            Err(_) => {
                warn!(
                    event = ?event,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Broker did not accept client event in time, dropping"
                );
                false
            }
        }
    }

    /// Start tracking a new client connection.
    pub fn session(self: &Arc<Self>, client_id: impl Into<String>) -> ClientSession {
        ClientSession {
            bridge: Arc::clone(self),
            client_id: client_id.into(),
            name: None,
        }
    }
}

/// State for one connected client.
pub struct ClientSession {
    bridge: Arc<Bridge>,
    client_id: String,
    name: Option<String>,
}

impl ClientSession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Name announced by the client's latest `join`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Handle one text frame from the client.
    pub async fn on_text(&mut self, text: &str) {
        let event = match BridgeEvent::decode(text.as_bytes()) {
            Ok(event) => event,
            Err(DecodeError::Json(e)) => {
                warn!(
                    client_id = %self.client_id,
                    error = %e,
                    "Client frame is not valid JSON, ignoring"
                );
                return;
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "Unknown client event, ignoring");
                return;
            }
        };

        match &event {
            BridgeEvent::Join { name } => {
                self.name = Some(name.clone());
                self.bridge.publish(&event).await;
            }
            BridgeEvent::Message { .. } => {
                self.bridge.publish(&event).await;
            }
            BridgeEvent::Leave { .. } => {
                debug!(client_id = %self.client_id, "Ignoring client-sent leave");
            }
        }
    }

    /// Handle the connection closing. Publishes a leave for a joined client.
    pub async fn on_close(self) {
        if let Some(name) = self.name {
            self.bridge.publish(&BridgeEvent::Leave { name }).await;
        }
    }
}
