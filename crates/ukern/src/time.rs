//! System tick clock and timeout-to-deadline conversion.

use std::sync::OnceLock;
use std::time::Instant;

/// Sentinel meaning "wait forever".
pub const MAX_TIME: u64 = u64::MAX;

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

/// Monotonic tick count since process start, in nanoseconds.
#[must_use]
pub fn system_tick() -> u64 {
    u64::try_from(epoch().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Converts a relative timeout (nanoseconds) into an absolute tick deadline
/// suitable for [`crate::scheduler`] sleeps. A non-positive timeout collapses
/// to [`MAX_TIME`] (infinite) rather than an already-past deadline, since a
/// sleep request uses this to mean "no timeout specified".
#[must_use]
pub fn absolute_deadline(timeout_ns: i64) -> u64 {
    if timeout_ns <= 0 {
        return MAX_TIME;
    }
    system_tick().saturating_add(timeout_ns as u64)
}

/// Milliseconds remaining until `deadline`, saturating at zero.
#[must_use]
pub fn millis_until(deadline: u64) -> u64 {
    if deadline == MAX_TIME {
        return MAX_TIME;
    }
    let now = system_tick();
    if deadline <= now {
        0
    } else {
        (deadline - now) / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_infinite_not_expired() {
        assert_eq!(absolute_deadline(0), MAX_TIME);
        assert_eq!(absolute_deadline(-5), MAX_TIME);
    }

    #[test]
    fn positive_timeout_is_in_the_future() {
        let deadline = absolute_deadline(1_000_000_000);
        assert!(deadline > system_tick());
    }
}
