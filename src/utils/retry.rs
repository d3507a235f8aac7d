//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker connection attempts.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: `max_times` (not counting the first try)
/// - Jitter enabled
pub fn connection_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_times)
        .with_jitter()
}

/// Backoff between consumer re-subscriptions after the broker ends a stream.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Max attempts: 10
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(10)
        .with_jitter()
}
