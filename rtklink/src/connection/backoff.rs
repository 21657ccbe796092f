//! Reconnection delay schedule shared by the connection drivers.

use std::time::Duration;

/// Delay before the first reconnection attempt.
pub(crate) const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the exponential schedule.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff: 100ms, 200ms, 400ms, ... capped at 5s.
///
/// `attempt` counts failed attempts since the last successful connection,
/// starting at zero.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let multiplier = 1u32 << attempt.min(10);
    (INITIAL_RETRY_DELAY * multiplier).min(MAX_RETRY_DELAY)
}
