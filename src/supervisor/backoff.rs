//! Restart backoff — `min(1s * 2^n, 30s)`, deterministic.
//!
//! Deliberately unjittered: callers that watch the restart sequence need it
//! monotonically non-decreasing attempt over attempt, and randomized jitter
//! could make a later attempt land sooner than an earlier one.

use std::time::Duration;

const BASE_MS: u64 = 1_000;
const MAX_MS: u64 = 30_000;

/// Backoff delay before the `n`th restart attempt (0-indexed).
pub fn restart_delay(attempt: u32) -> Duration {
    let shift = attempt.min(31); // avoid overflow on pathological counters
    let raw = BASE_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(raw.min(MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        assert_eq!(restart_delay(0), Duration::from_millis(1_000));
        assert_eq!(restart_delay(1), Duration::from_millis(2_000));
        assert_eq!(restart_delay(2), Duration::from_millis(4_000));
        assert_eq!(restart_delay(4), Duration::from_millis(16_000));
        assert_eq!(restart_delay(5), Duration::from_millis(30_000));
        assert_eq!(restart_delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn monotonically_non_decreasing() {
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let d = restart_delay(attempt);
            assert!(d >= prev);
            prev = d;
        }
    }
}
