//! Process-wide AMQP connection.
//!
//! One connection and one channel are shared by every consumer and
//! publisher in the process. The first `get()` dials the broker; later
//! calls reuse the channel while it stays connected and redial once it
//! does not.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{options::ConfirmSelectOptions, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{BrokerError, Result};
use crate::utils::retry::connection_backoff;

/// Default number of connection attempts before giving up.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 10;

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Lazily established, shared broker channel.
///
/// The session sits behind an async mutex that is held for the whole
/// connect attempt, so concurrent callers wait for the attempt in flight
/// instead of dialing their own. A failed attempt leaves the slot empty
/// and the next caller starts over.
pub struct BrokerConnection {
    url: String,
    backoff: ExponentialBuilder,
    session: Mutex<Option<Session>>,
}

impl BrokerConnection {
    /// Create a manager for `url`. Nothing is dialed until `get()`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_backoff(url, connection_backoff(DEFAULT_CONNECT_ATTEMPTS))
    }

    pub fn with_backoff(url: impl Into<String>, backoff: ExponentialBuilder) -> Self {
        Self {
            url: url.into(),
            backoff,
            session: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Return the shared channel, connecting or reconnecting as needed.
    pub async fn get(&self) -> Result<Channel> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.is_connected() {
                return Ok(session.channel.clone());
            }
            warn!(url = %redact(&self.url), "Broker connection lost, reconnecting");
            *slot = None;
        }

        let session = self.connect_with_retry().await?;
        let channel = session.channel.clone();
        *slot = Some(session);
        Ok(channel)
    }

    async fn connect_with_retry(&self) -> Result<Session> {
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(self.backoff.build())
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.connect().await {
                Ok(session) => {
                    info!(url = %redact(&self.url), attempt = attempt + 1, "Connected to broker");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to connect to broker, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| BrokerError::Connect("No connection attempt made".to_string()));
        error!(url = %redact(&self.url), error = %err, "Giving up on broker connection");
        Err(err)
    }

    async fn connect(&self) -> Result<Session> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(format!("Failed to create channel: {}", e)))?;

        // Publishes wait for broker confirmation.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connect(format!("Failed to enable confirms: {}", e)))?;

        Ok(Session {
            connection,
            channel,
        })
    }
}

/// Strip credentials from an AMQP URL before logging it.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
