//! Jobs: the handler contract and the registry that maps names to handlers.
//!
//! This module contains:
//! - `JobHandler` trait: async handler invoked with a job's payload
//! - `JobFn`: closure-backed handler
//! - `JobRegistry`: immutable name -> handler map, loaded from a directory
//! - Built-in handlers (`log`, `broadcast`)

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::BrokerError;
use crate::envelope::DecodeError;

pub mod builtin;
pub mod registry;

pub use builtin::{BroadcastJob, LogJob};
pub use registry::{HandlerCatalog, JobRegistry, JobRegistryBuilder, RegistryLoadError};

/// Errors raised by a job handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] DecodeError),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Build from a caught panic payload.
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        HandlerError::Panicked(message)
    }
}

/// Handler for one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process the payload of one delivered job.
    async fn handle(&self, payload: Value) -> Result<(), HandlerError>;
}

/// Closure-backed job handler.
///
/// The closure creates a fresh future per invocation; share state through
/// `Arc` captured by the closure.
pub struct JobFn<F> {
    f: F,
}

impl<F> JobFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wrap the closure as a shared handler.
    pub fn arc<Fut>(f: F) -> Arc<dyn JobHandler>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> JobHandler for JobFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        (self.f)(payload).await
    }
}
