//! courier-worker: job queue consumer
//!
//! Loads job manifests, then consumes `{job, payload}` envelopes from one
//! queue, one at a time.
//!
//! ## Architecture
//! ```text
//! [producer] --dispatch--> [queue] --prefetch 1--> [courier-worker] --> handler
//!                             ^
//!               [fanout exchange] (optional, --exchange)
//! ```
//!
//! ## Configuration
//! - `--queue` / COURIER__WORKER__QUEUE (default: `default`)
//! - `--exchange` / COURIER__WORKER__EXCHANGE (optional)
//! - `--jobs-dir` / COURIER__WORKER__JOBS_DIR (default: `jobs`)
//! - AMQP_URL / COURIER__BROKER__URL

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use courier::config::Config;
use courier::jobs::{HandlerCatalog, JobRegistry};
use courier::utils::bootstrap::{connect_broker, init_tracing, shutdown_signal};
use courier::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "courier-worker", version, about = "Consume and run queued jobs")]
struct Args {
    /// Queue to consume.
    #[arg(long)]
    queue: Option<String>,

    /// Fanout exchange to bind the queue to.
    #[arg(long)]
    exchange: Option<String>,

    /// Directory holding job manifests.
    #[arg(long)]
    jobs_dir: Option<PathBuf>,

    /// Configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let queue = args.queue.unwrap_or_else(|| config.worker.queue.clone());
    let exchange = args.exchange.or_else(|| config.worker.exchange.clone());
    let jobs_dir = args
        .jobs_dir
        .unwrap_or_else(|| config.worker.jobs_dir.clone());

    let broker = connect_broker(&config.broker);
    let catalog = HandlerCatalog::builtin(Arc::clone(&broker), config.bridge.exchange.clone());
    let registry = JobRegistry::load(&jobs_dir, &catalog)?;
    let worker = Worker::with_options(Arc::new(registry), broker, config.worker.options());

    info!(
        queue = %queue,
        exchange = exchange.as_deref().unwrap_or("none"),
        "courier-worker started"
    );

    tokio::select! {
        result = worker.listen(&queue, exchange.as_deref()) => result?,
        _ = shutdown_signal() => info!("courier-worker stopping"),
    }

    Ok(())
}
