//! Message broker access.
//!
//! This module contains:
//! - `Broker` trait: queue/exchange topology, publishing and consuming
//! - `Delivery`: a received message that must be settled exactly once
//! - `BrokerConnection`: lazily established, shared AMQP channel
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod amqp;
pub mod connection;
pub mod memory;

pub use amqp::AmqpBroker;
pub use connection::BrokerConnection;
pub use memory::MemoryBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Settling delivery failed: {0}")]
    Settle(String),
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
    /// Survive broker restarts.
    pub durable: bool,
    /// Only usable by the declaring connection.
    pub exclusive: bool,
    /// Deleted once the last consumer goes away.
    pub auto_delete: bool,
    /// Exchange that receives rejected messages.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable, shared work queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Default::default()
        }
    }

    /// Server-named, exclusive, auto-deleting queue for one subscriber.
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: None,
        }
    }

    /// Route rejected messages to `exchange`.
    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }
}

/// Where a published message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Straight to a queue through the default exchange.
    Queue(String),
    /// To a fanout exchange; the routing key is ignored.
    Exchange(String),
}

impl std::fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishTarget::Queue(name) => write!(f, "queue \"{}\"", name),
            PublishTarget::Exchange(name) => write!(f, "exchange \"{}\"", name),
        }
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
///
/// Settling consumes the delivery, so it can be acknowledged or rejected
/// once and only once.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Remove the message from the queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Discard the message (or dead-letter it, if the queue says so).
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the broker cancels it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Interface to the message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: in-process broker for tests and local runs
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue and return its (possibly server-generated) name.
    ///
    /// Declaring the same queue with the same options is idempotent.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Declare a durable fanout exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Bind a queue to a fanout exchange with an empty routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Limit unacknowledged deliveries held by consumers created afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a persistent message.
    async fn publish(&self, target: &PublishTarget, body: &[u8]) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}
