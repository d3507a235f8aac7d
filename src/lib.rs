//! Courier - job queue worker and pub/sub bridge over AMQP.
//!
//! Producers enqueue `{job, payload}` envelopes with a `Dispatcher`; a
//! `Worker` consumes them one at a time and runs the registered handler.
//! The `Bridge` fans client events through a shared exchange so every
//! connected client, on every bridge instance, sees the same stream.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod envelope;
pub mod jobs;
pub mod utils;
pub mod worker;
