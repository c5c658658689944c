//! Retry utilities: backoff builders.
//!
//! Uses `backon`. Broker connects retry on a fixed interval.

use std::time::Duration;

use backon::ConstantBuilder;

/// Backoff for broker connection attempts.
///
/// - Fixed delay: `interval`
/// - Max attempts: `max_attempts` (first attempt included), unbounded when `None`
/// - No jitter
pub fn reconnect_backoff(interval: Duration, max_attempts: Option<usize>) -> ConstantBuilder {
    let retries = match max_attempts {
        Some(attempts) => attempts.saturating_sub(1),
        None => usize::MAX,
    };
    ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(retries)
}
