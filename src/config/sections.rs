//! Configuration sections, one per component.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::{DEFAULT_EXCHANGE, DEFAULT_PUBLISH_TIMEOUT};
use crate::broker::QueueSpec;
use crate::dispatch::DispatchRoute;
use crate::jobs::builtin::BROADCAST_KIND;
use crate::worker::{WorkerOptions, DEFAULT_QUEUE};

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connection attempts before `get()` gives up.
    pub connect_attempts: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_attempts: 10,
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue: String,
    /// Fanout exchange to bind the queue to, if any.
    pub exchange: Option<String>,
    /// Directory holding job manifests.
    pub jobs_dir: PathBuf,
    /// Per-job deadline. Unset means no deadline.
    pub handler_timeout_secs: Option<u64>,
    pub dead_letter_exchange: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            exchange: None,
            jobs_dir: PathBuf::from("jobs"),
            handler_timeout_secs: None,
            dead_letter_exchange: None,
        }
    }
}

impl WorkerConfig {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            handler_timeout: self.handler_timeout_secs.map(Duration::from_secs),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
        }
    }

    /// Options the worker declares its queue with.
    pub fn queue_spec(&self) -> QueueSpec {
        self.options().queue_spec(&self.queue)
    }
}

/// Bridge settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub exchange: String,
    /// How long a client event may wait on the broker before it is dropped.
    pub publish_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            exchange: DEFAULT_EXCHANGE.to_string(),
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BridgeConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Where dispatched jobs go.
///
/// An exchange, when set, wins over the queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue: String,
    pub exchange: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            exchange: None,
        }
    }
}

impl DispatchConfig {
    pub fn route(&self) -> DispatchRoute {
        match &self.exchange {
            Some(exchange) => DispatchRoute::Exchange(exchange.clone()),
            None => DispatchRoute::Queue(QueueSpec::durable(self.queue.clone())),
        }
    }
}

/// Control endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Name reported by `/health` and `initialize`.
    pub service_name: String,
    /// Job dispatched by the `broadcastMessage` tool.
    pub broadcast_job: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            service_name: "courier-control".to_string(),
            broadcast_job: BROADCAST_KIND.to_string(),
        }
    }
}
