//! courier-bridge: WebSocket <-> AMQP fanout bridge
//!
//! ## Architecture
//! ```text
//! [client] --ws--> [courier-bridge] --publish--> [fanout exchange]
//!    ^                    |                              |
//!    +----- broadcast ----+<---- exclusive queue <-------+
//! ```
//!
//! Clients are accepted right away. Until the exchange and queue are set
//! up, client events are dropped with a warning.
//!
//! ## Configuration
//! - `--exchange` / COURIER__BRIDGE__EXCHANGE (default: `websocket`)
//! - `--port` / SOCKET_PORT / COURIER__BRIDGE__PORT (default: 8081)
//! - COURIER__BRIDGE__PUBLISH_TIMEOUT_MS (default: 2000)
//! - AMQP_URL / COURIER__BROKER__URL

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use courier::bridge::ws::{router, start_heartbeat};
use courier::bridge::Bridge;
use courier::config::Config;
use courier::utils::bootstrap::{connect_broker, init_tracing, shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "courier-bridge", version, about = "Relay client events through a fanout exchange")]
struct Args {
    /// Fanout exchange shared by every bridge instance.
    #[arg(long)]
    exchange: Option<String>,

    /// WebSocket listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let exchange = args
        .exchange
        .unwrap_or_else(|| config.bridge.exchange.clone());
    let port = args.port.unwrap_or(config.bridge.port);

    let bridge = Arc::new(
        Bridge::new(exchange.clone()).with_publish_timeout(config.bridge.publish_timeout()),
    );
    let broker = connect_broker(&config.broker);

    let mut relay = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.run(broker).await }
    });
    let heartbeat = start_heartbeat(Arc::clone(&bridge));

    let listener = TcpListener::bind((config.bridge.host.as_str(), port)).await?;
    info!(port = %port, exchange = %exchange, "courier-bridge started");

    let pool = Arc::clone(bridge.pool());
    let server = axum::serve(listener, router(Arc::clone(&bridge))).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            pool.shutdown_all().await;
        },
    );

    tokio::select! {
        result = server.into_future() => result?,
        result = &mut relay => {
            heartbeat.abort();
            let err = match result {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "relay ended".to_string(),
                Err(e) => e.to_string(),
            };
            error!(error = %err, "Bridge relay stopped");
            return Err(err.into());
        }
    }

    heartbeat.abort();
    relay.abort();
    info!("courier-bridge stopped");
    Ok(())
}
