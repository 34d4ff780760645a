//! Wall-clock helpers
//!
//! Deadlines are absolute unix timestamps in milliseconds so that a snapshot
//! reloaded after a restart preserves the remaining TTL of every key.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
