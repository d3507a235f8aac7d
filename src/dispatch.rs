//! Job dispatch.
//!
//! Application code enqueues work with `Dispatcher::dispatch(job, payload)`
//! without knowing which queue or exchange the workers listen on. The
//! envelope is the same `{job, payload}` shape the worker decodes.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::broker::{Broker, BrokerError, PublishTarget, QueueSpec};
use crate::envelope::JobEnvelope;

/// Errors surfaced to callers of `dispatch`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to encode job envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Where dispatched jobs are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchRoute {
    /// A work queue, declared with these options before the first publish.
    Queue(QueueSpec),
    /// A fanout exchange, declared before the first publish.
    Exchange(String),
}

impl Default for DispatchRoute {
    fn default() -> Self {
        DispatchRoute::Queue(QueueSpec::durable(crate::worker::DEFAULT_QUEUE))
    }
}

/// Publishes job envelopes.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    route: DispatchRoute,
    target: OnceCell<PublishTarget>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, route: DispatchRoute) -> Self {
        Self {
            broker,
            route,
            target: OnceCell::new(),
        }
    }

    pub fn route(&self) -> &DispatchRoute {
        &self.route
    }

    /// Enqueue `job` with `payload`.
    ///
    /// Broker failures are returned to the caller, never swallowed.
    pub async fn dispatch(&self, job: &str, payload: Value) -> Result<(), DispatchError> {
        let body = JobEnvelope::new(job, payload).encode()?;
        let target = self.ensure_topology().await?;

        if let Err(e) = self.broker.publish(target, &body).await {
            error!(job = %job, target = %target, error = %e, "Failed to dispatch job");
            return Err(e.into());
        }

        debug!(job = %job, target = %target, "Dispatched job");
        Ok(())
    }

    /// Declare the route once; later calls reuse the result.
    async fn ensure_topology(&self) -> Result<&PublishTarget, BrokerError> {
        self.target
            .get_or_try_init(|| async {
                match &self.route {
                    DispatchRoute::Queue(spec) => {
                        let name = self.broker.declare_queue(spec).await?;
                        Ok::<_, BrokerError>(PublishTarget::Queue(name))
                    }
                    DispatchRoute::Exchange(exchange) => {
                        self.broker.declare_exchange(exchange).await?;
                        Ok(PublishTarget::Exchange(exchange.clone()))
                    }
                }
            })
            .await
    }
}

/// Dispatcher with one job name baked in.
#[derive(Clone)]
pub struct JobDispatcher {
    dispatcher: Arc<Dispatcher>,
    job: String,
}

impl JobDispatcher {
    pub fn new(dispatcher: Arc<Dispatcher>, job: impl Into<String>) -> Self {
        Self {
            dispatcher,
            job: job.into(),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub async fn dispatch(&self, payload: Value) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(&self.job, payload).await
    }
}
