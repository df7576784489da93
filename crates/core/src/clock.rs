//! Clock helpers
//!
//! History entries carry two time values: wall-clock milliseconds for
//! display and persistence, and monotonic nanoseconds for ordering within
//! a process. The monotonic value is measured against a process-start
//! anchor so it survives wall-clock adjustments.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::Utc;

static MONOTONIC_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Nanoseconds elapsed since the first call in this process.
pub fn monotonic_nanos() -> u64 {
    let anchor = MONOTONIC_ANCHOR.get_or_init(Instant::now);
    let nanos = anchor.elapsed().as_nanos();
    nanos.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_is_non_decreasing() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_now_millis_is_plausible() {
        // 2020-01-01 in milliseconds.
        assert!(now_millis() > 1_577_836_800_000);
    }
}
