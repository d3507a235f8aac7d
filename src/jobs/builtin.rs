//! Built-in job handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{HandlerError, JobHandler};
use crate::broker::{Broker, PublishTarget};
use crate::envelope::BridgeEvent;

/// Handler kind for `LogJob`.
pub const LOG_KIND: &str = "log";
/// Handler kind for `BroadcastJob`.
pub const BROADCAST_KIND: &str = "broadcast";

/// Records the payload and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogJob;

#[async_trait]
impl JobHandler for LogJob {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        info!(payload = %payload, "Job payload received");
        Ok(())
    }
}

/// Relays a bridge event onto the bridge exchange.
///
/// The payload must be a bridge event (`join`, `leave` or `message`);
/// every bridge instance bound to the exchange then broadcasts it to its
/// clients.
pub struct BroadcastJob {
    broker: Arc<dyn Broker>,
    exchange: String,
    declared: OnceCell<()>,
}

impl BroadcastJob {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            declared: OnceCell::new(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl JobHandler for BroadcastJob {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        let event = BridgeEvent::from_value(payload)?;

        self.declared
            .get_or_try_init(|| self.broker.declare_exchange(&self.exchange))
            .await?;

        let body = event
            .encode()
            .map_err(|e| HandlerError::failed(format!("Failed to encode event: {}", e)))?;
        self.broker
            .publish(&PublishTarget::Exchange(self.exchange.clone()), &body)
            .await?;

        debug!(exchange = %self.exchange, "Broadcast event relayed");
        Ok(())
    }
}
