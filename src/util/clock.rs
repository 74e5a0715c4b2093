//! Wall-clock helpers.
//!
//! All persisted timestamps in the engine are milliseconds since the Unix
//! epoch, so restarts and log replays compare times without a shared
//! monotonic base.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are well past 2020.
        assert!(a > 1_577_836_800_000);
    }
}
