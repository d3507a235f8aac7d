//! Worker consumer loop.
//!
//! `Worker::listen(queue, exchange)` declares the queue (and optionally
//! binds it to a fanout exchange), limits the consumer to one
//! unacknowledged delivery, and then runs every delivery through the job
//! registry:
//!
//! ```text
//! received -> decoding -> dispatching -> acked
//!                 |             |
//!                 +-------------+------> rejected (no requeue)
//! ```
//!
//! A failing message is never redelivered by this consumer. Retrying is the
//! job of a dead-letter queue and a separate consumer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::BackoffBuilder;
use futures::{FutureExt, StreamExt};
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryStream, QueueSpec, Result};
use crate::envelope::{DecodeError, JobEnvelope};
use crate::jobs::{HandlerError, JobRegistry};
use crate::utils::retry::resubscribe_backoff;

/// Queue used when none is configured.
pub const DEFAULT_QUEUE: &str = "default";

/// Unacknowledged deliveries a worker may hold. One at a time, strictly.
pub const PREFETCH: u16 = 1;

/// Why a single message was rejected.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to decode job envelope: {0}")]
    Decode(#[from] DecodeError),

    #[error("Job \"{0}\" is not registered")]
    NotRegistered(String),

    #[error("Job \"{job}\" failed: {source}")]
    Handler {
        job: String,
        #[source]
        source: HandlerError,
    },
}

impl JobError {
    /// Job name, when the envelope got far enough to have one.
    pub fn job(&self) -> Option<&str> {
        match self {
            JobError::Decode(_) => None,
            JobError::NotRegistered(job) | JobError::Handler { job, .. } => Some(job),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug)]
pub enum Outcome {
    Acked { job: String, elapsed: Duration },
    Rejected { error: JobError },
}

/// Worker tuning.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Deadline for one handler invocation. Expiry counts as a failure.
    pub handler_timeout: Option<Duration>,
    /// Exchange that receives rejected messages, set on queue declaration.
    pub dead_letter_exchange: Option<String>,
}

impl WorkerOptions {
    /// Declaration options for `queue`. Producers declaring the same queue
    /// must use the same options.
    pub fn queue_spec(&self, queue: &str) -> QueueSpec {
        QueueSpec::durable(queue).with_dead_letter_exchange(self.dead_letter_exchange.clone())
    }
}

/// Consumes job envelopes and runs them through the registry.
pub struct Worker {
    registry: Arc<JobRegistry>,
    broker: Arc<dyn Broker>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(registry: Arc<JobRegistry>, broker: Arc<dyn Broker>) -> Self {
        Self::with_options(registry, broker, WorkerOptions::default())
    }

    pub fn with_options(
        registry: Arc<JobRegistry>,
        broker: Arc<dyn Broker>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            registry,
            broker,
            options,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Consume `queue` until a fatal broker error.
    ///
    /// Setup failures on the first subscription are returned immediately.
    /// If the broker later ends the consumer, the worker subscribes again
    /// with backoff and only gives up once the backoff is exhausted.
    pub async fn listen(&self, queue: &str, exchange: Option<&str>) -> Result<()> {
        let mut stream = self.subscribe(queue, exchange).await?;
        let backoff = resubscribe_backoff();
        let mut delays = backoff.build();

        loop {
            if self.drain(queue, &mut stream).await > 0 {
                delays = backoff.build();
            }
            warn!(queue = %queue, "Consumer stream ended, re-subscribing");

            stream = loop {
                let delay = delays.next().ok_or_else(|| {
                    BrokerError::Consume(format!("Gave up re-subscribing to queue \"{}\"", queue))
                })?;
                tokio::time::sleep(delay).await;

                match self.subscribe(queue, exchange).await {
                    Ok(stream) => break stream,
                    Err(e) => warn!(queue = %queue, error = %e, "Re-subscribe failed"),
                }
            };
        }
    }

    /// Declare topology and start a consumer.
    async fn subscribe(&self, queue: &str, exchange: Option<&str>) -> Result<DeliveryStream> {
        let queue = self
            .broker
            .declare_queue(&self.options.queue_spec(queue))
            .await?;

        if let Some(exchange) = exchange {
            self.broker.declare_exchange(exchange).await?;
            self.broker.bind_queue(&queue, exchange).await?;
            info!(queue = %queue, exchange = %exchange, "Worker bound to fanout exchange");
        }

        self.broker.set_prefetch(PREFETCH).await?;
        let stream = self.broker.consume(&queue).await?;

        info!(
            queue = %queue,
            exchange = exchange.unwrap_or("none"),
            jobs = ?self.registry.names(),
            "Worker listening"
        );
        Ok(stream)
    }

    /// Process deliveries until the stream ends or errors. Returns how many
    /// deliveries were processed.
    async fn drain(&self, queue: &str, stream: &mut DeliveryStream) -> usize {
        let mut processed = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(delivery) => {
                    self.process(queue, delivery).await;
                    processed += 1;
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Consumer delivery error");
                    break;
                }
            }
        }
        processed
    }

    /// Run one delivery and settle it: ack on success, reject without
    /// requeue on any failure.
    pub async fn process(&self, queue: &str, delivery: Delivery) -> Outcome {
        let start = Instant::now();

        match self.execute(queue, delivery.body()).await {
            Ok(job) => {
                let elapsed = start.elapsed();
                info!(
                    job = %job,
                    queue = %queue,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                if let Err(e) = delivery.ack().await {
                    error!(job = %job, queue = %queue, error = %e, "Failed to ack message");
                }
                Outcome::Acked { job, elapsed }
            }
            Err(err) => {
                error!(
                    job = err.job().unwrap_or("unknown"),
                    queue = %queue,
                    error = %err,
                    "Job failed, rejecting without requeue"
                );
                if let Err(e) = delivery.reject(false).await {
                    error!(queue = %queue, error = %e, "Failed to reject message");
                }
                Outcome::Rejected { error: err }
            }
        }
    }

    /// Decode, resolve and invoke the handler for one message body.
    pub async fn execute(&self, queue: &str, body: &[u8]) -> std::result::Result<String, JobError> {
        let JobEnvelope { job, payload } = JobEnvelope::decode(body)?;

        let handler = self
            .registry
            .get(&job)
            .ok_or_else(|| JobError::NotRegistered(job.clone()))?;

        info!(job = %job, queue = %queue, "Executing job");

        // A panicking handler fails its own message, not the consumer loop.
        let guarded = AssertUnwindSafe(handler.handle(payload))
            .catch_unwind()
            .map(|result| result.unwrap_or_else(|panic| Err(HandlerError::panicked(&*panic))));

        let result = match self.options.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or(Err(HandlerError::TimedOut(limit))),
            None => guarded.await,
        };

        match result {
            Ok(()) => Ok(job),
            Err(source) => Err(JobError::Handler { job, source }),
        }
    }
}

#[cfg(test)]
mod tests;
