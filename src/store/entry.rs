//! Entry structure for key-value pairs

use super::value::Value;

/// Represents a single entry in the store
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The value
    pub value: Value,

    /// Optional expiration deadline, absolute unix milliseconds.
    /// An entry past its deadline is logically absent even before it is
    /// physically removed.
    pub expire_at: Option<u64>,

    /// Version number for optimistic concurrency control. Assigned from the
    /// keyspace's monotonic clock on every mutation, so a deleted and
    /// recreated key can never reuse a version.
    pub version: u64,

    /// Last access timestamp in milliseconds (approximate-LRU metadata)
    pub last_access_ms: u64,

    /// Access frequency counter (approximate-LFU metadata), decayed lazily
    pub freq: u8,

    /// Timestamp of the last LFU decay application
    pub last_decay_ms: u64,
}

impl Entry {
    /// Create a new entry without expiration
    pub fn new(value: Value, now_ms: u64) -> Self {
        Entry {
            value,
            expire_at: None,
            version: 0,
            last_access_ms: now_ms,
            freq: 1,
            last_decay_ms: now_ms,
        }
    }

    /// Create a new entry with an absolute expiration deadline
    pub fn with_deadline(value: Value, expire_at: Option<u64>, now_ms: u64) -> Self {
        Entry {
            expire_at,
            ..Entry::new(value, now_ms)
        }
    }

    /// Check if the entry has expired at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expire_at {
            Some(deadline) => now_ms >= deadline,
            None => false,
        }
    }

    /// Remaining lifetime in milliseconds.
    ///
    /// Returns:
    /// - `Some(n)`: remaining milliseconds
    /// - `None`: no expiration
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.expire_at.map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// Mark this entry as accessed: refresh the recency token and bump the
    /// decayed frequency counter.
    pub fn touch(&mut self, now_ms: u64, decay_period_ms: u64) {
        self.last_access_ms = now_ms;
        self.apply_decay(now_ms, decay_period_ms);
        self.freq = self.freq.saturating_add(1);
    }

    /// Frequency as seen at `now_ms`, with pending decay applied.
    pub fn decayed_freq(&self, now_ms: u64, decay_period_ms: u64) -> u8 {
        if decay_period_ms == 0 {
            return self.freq;
        }
        let elapsed_periods = now_ms.saturating_sub(self.last_decay_ms) / decay_period_ms;
        self.freq.saturating_sub(elapsed_periods.min(u64::from(u8::MAX)) as u8)
    }

    fn apply_decay(&mut self, now_ms: u64, decay_period_ms: u64) {
        if decay_period_ms == 0 {
            return;
        }
        let elapsed_periods = now_ms.saturating_sub(self.last_decay_ms) / decay_period_ms;
        if elapsed_periods > 0 {
            self.freq = self
                .freq
                .saturating_sub(elapsed_periods.min(u64::from(u8::MAX)) as u8);
            self.last_decay_ms = now_ms;
        }
    }

    /// Approximate memory cost of this entry's value plus metadata, in bytes.
    /// The key's cost is added by the keyspace.
    pub fn memory_usage(&self) -> usize {
        self.value.memory_usage() + std::mem::size_of::<Entry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_never_expires() {
        let entry = Entry::new(Value::str("v"), 1000);
        assert!(!entry.is_expired(u64::MAX));
        assert_eq!(entry.remaining_ms(5000), None);
    }

    #[test]
    fn test_deadline_expiry() {
        let entry = Entry::with_deadline(Value::str("v"), Some(2000), 1000);
        assert!(!entry.is_expired(1999));
        assert!(entry.is_expired(2000));
        assert_eq!(entry.remaining_ms(1500), Some(500));
        assert_eq!(entry.remaining_ms(3000), Some(0));
    }

    #[test]
    fn test_touch_updates_recency_and_frequency() {
        let mut entry = Entry::new(Value::str("v"), 0);
        entry.touch(500, 60_000);
        assert_eq!(entry.last_access_ms, 500);
        assert_eq!(entry.freq, 2);
    }

    #[test]
    fn test_lfu_decay_is_lazy() {
        let mut entry = Entry::new(Value::str("v"), 0);
        for _ in 0..10 {
            entry.touch(0, 60_000);
        }
        assert_eq!(entry.freq, 11);

        // Three full decay periods elapse without touches.
        assert_eq!(entry.decayed_freq(180_000, 60_000), 8);

        // Touching applies the decay before incrementing.
        entry.touch(180_000, 60_000);
        assert_eq!(entry.freq, 9);
    }
}
