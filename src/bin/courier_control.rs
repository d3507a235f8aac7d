//! courier-control: JSON-RPC tool endpoint
//!
//! Exposes `ping` and `broadcastMessage`. The latter dispatches the
//! broadcast job, which a worker relays to every bridge client.
//!
//! ## Configuration
//! - `--port` / MCP_PORT / COURIER__CONTROL__PORT (default: 7777)
//! - COURIER__DISPATCH__QUEUE or COURIER__DISPATCH__EXCHANGE
//! - AMQP_URL / COURIER__BROKER__URL

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use courier::config::Config;
use courier::control::{router, BroadcastMessageTool, PingTool, ToolRegistry};
use courier::dispatch::Dispatcher;
use courier::utils::bootstrap::{connect_broker, init_tracing, shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "courier-control", version, about = "Serve control tools over JSON-RPC")]
struct Args {
    /// HTTP listening port.
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
    let port = args.port.unwrap_or(config.control.port);

    let broker = connect_broker(&config.broker);
    let dispatcher = Arc::new(Dispatcher::new(broker, config.dispatch_route()));

    let mut tools = ToolRegistry::new();
    tools.register(PingTool);
    tools.register(BroadcastMessageTool::with_job(
        dispatcher,
        config.control.broadcast_job.clone(),
    ));
    let tools = Arc::new(tools);

    let listener = TcpListener::bind((config.control.host.as_str(), port)).await?;
    info!(
        port = %port,
        tools = ?tools.names(),
        "courier-control started"
    );

    axum::serve(listener, router(tools, &config.control.service_name))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("courier-control stopped");
    Ok(())
}
