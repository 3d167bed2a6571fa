//! Deadline arithmetic that never overflows.

use std::time::{Duration, Instant};

/// Longest timeout the engine applies on its own: 24 hours.
///
/// A zero caller timeout means "no timeout" and maps to this value.
pub const NO_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// `start + timeout`, saturating at `start + NO_TIMEOUT` when the sum is
/// not representable.
///
/// ```
/// use std::time::{Duration, Instant};
/// use shardcomm_core::{NO_TIMEOUT, deadline_after};
///
/// let start = Instant::now();
/// assert_eq!(deadline_after(start, Duration::from_secs(1)), start + Duration::from_secs(1));
/// assert_eq!(deadline_after(start, Duration::MAX), start + NO_TIMEOUT);
/// ```
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(NO_TIMEOUT))
        .unwrap_or(start)
}
