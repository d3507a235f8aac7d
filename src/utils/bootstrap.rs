//! Bootstrap utilities for courier binaries.
//!
//! Shared initialization code for the worker, bridge and control binaries.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::connection::redact;
use crate::broker::{AmqpBroker, Broker, BrokerConnection};
use crate::config::{BrokerConfig, LOG_ENV_VAR};
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the AMQP broker handle shared by a process.
///
/// No connection is made here; the first broker call connects.
pub fn connect_broker(config: &BrokerConfig) -> Arc<dyn Broker> {
    info!(url = %redact(&config.url), "Using AMQP broker");
    let connection = BrokerConnection::with_backoff(
        config.url.clone(),
        connection_backoff(config.connect_attempts),
    );
    Arc::new(AmqpBroker::new(Arc::new(connection)))
}

/// Resolve once Ctrl-C (or SIGTERM on unix) is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
