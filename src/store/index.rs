//! Secondary key indexes
//!
//! Two structures kept in lockstep with the keyspace map:
//!
//! - [`SampleSet`]: a dense vector of keys plus a position map. O(1) insert,
//!   remove (swap-remove) and uniform random sampling; backs cursor scans and
//!   eviction sampling without any ordered bookkeeping.
//! - [`TtlIndex`]: the subset of keys carrying a deadline, ordered by
//!   deadline for exact shortest-TTL lookups and sampled randomly for the
//!   active expiry sweep.

use bytes::Bytes;
use rand::Rng;
use siphasher::sip::SipHasher13;
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasherDefault;

type PosMap = HashMap<Bytes, usize, BuildHasherDefault<SipHasher13>>;
type DeadlineMap = HashMap<Bytes, u64, BuildHasherDefault<SipHasher13>>;

/// Dense set of keys supporting O(1) uniform random sampling.
#[derive(Debug, Default)]
pub(crate) struct SampleSet {
    keys: Vec<Bytes>,
    pos: PosMap,
}

impl SampleSet {
    pub fn new() -> Self {
        SampleSet::default()
    }

    pub fn insert(&mut self, key: Bytes) -> bool {
        if self.pos.contains_key(&key) {
            return false;
        }
        self.pos.insert(key.clone(), self.keys.len());
        self.keys.push(key);
        true
    }

    pub fn remove(&mut self, key: &Bytes) -> bool {
        let Some(index) = self.pos.remove(key) else {
            return false;
        };
        self.keys.swap_remove(index);
        if let Some(moved) = self.keys.get(index) {
            self.pos.insert(moved.clone(), index);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.keys.get(index)
    }

    /// Up to `n` distinct keys drawn uniformly at random.
    pub fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<Bytes> {
        if n >= self.keys.len() {
            return self.keys.clone();
        }
        // n is small (eviction samples, sweep batches); rejection sampling
        // over the dense vector stays O(n) in expectation.
        let mut picked = std::collections::HashSet::with_capacity(n);
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let index = rng.random_range(0..self.keys.len());
            if picked.insert(index) {
                out.push(self.keys[index].clone());
            }
        }
        out
    }
}

/// Deadline-ordered index of the keys that carry a TTL.
#[derive(Debug, Default)]
pub(crate) struct TtlIndex {
    deadlines: DeadlineMap,
    by_deadline: BTreeSet<(u64, Bytes)>,
    sample: SampleSet,
}

impl TtlIndex {
    pub fn new() -> Self {
        TtlIndex::default()
    }

    /// Insert or update the deadline for `key`.
    pub fn set(&mut self, key: Bytes, deadline: u64) {
        if let Some(old) = self.deadlines.insert(key.clone(), deadline) {
            self.by_deadline.remove(&(old, key.clone()));
        } else {
            self.sample.insert(key.clone());
        }
        self.by_deadline.insert((deadline, key));
    }

    pub fn remove(&mut self, key: &Bytes) -> bool {
        let Some(deadline) = self.deadlines.remove(key) else {
            return false;
        };
        self.by_deadline.remove(&(deadline, key.clone()));
        self.sample.remove(key);
        true
    }

    pub fn contains(&self, key: &Bytes) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Key with the smallest deadline, if any.
    pub fn earliest(&self) -> Option<(u64, &Bytes)> {
        self.by_deadline.iter().next().map(|(d, k)| (*d, k))
    }

    /// Up to `n` distinct TTL-carrying keys drawn uniformly at random.
    pub fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<Bytes> {
        self.sample.sample(rng, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_sample_set_insert_remove() {
        let mut set = SampleSet::new();
        assert!(set.insert(key("a")));
        assert!(set.insert(key("b")));
        assert!(set.insert(key("c")));
        assert!(!set.insert(key("a")));
        assert_eq!(set.len(), 3);

        // Removing from the middle keeps positions consistent.
        assert!(set.remove(&key("a")));
        assert!(!set.remove(&key("a")));
        assert_eq!(set.len(), 2);
        assert!(set.remove(&key("b")));
        assert!(set.remove(&key("c")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_sample_returns_distinct_keys() {
        let mut set = SampleSet::new();
        for i in 0..100 {
            set.insert(key(&format!("k{i}")));
        }
        let mut rng = rand::rng();
        let sample = set.sample(&mut rng, 10);
        assert_eq!(sample.len(), 10);
        let distinct: std::collections::HashSet<_> = sample.iter().collect();
        assert_eq!(distinct.len(), 10);
    }

    #[test]
    fn test_sample_larger_than_population() {
        let mut set = SampleSet::new();
        set.insert(key("only"));
        let mut rng = rand::rng();
        assert_eq!(set.sample(&mut rng, 8), vec![key("only")]);
    }

    #[test]
    fn test_ttl_index_earliest() {
        let mut ttl = TtlIndex::new();
        assert!(ttl.is_empty());
        ttl.set(key("late"), 900);
        ttl.set(key("early"), 100);
        ttl.set(key("mid"), 500);
        assert!(ttl.contains(&key("mid")));
        assert!(!ttl.contains(&key("absent")));

        assert_eq!(ttl.earliest(), Some((100, &key("early"))));

        // Updating a deadline replaces the old ordering entry.
        ttl.set(key("early"), 1000);
        assert_eq!(ttl.earliest(), Some((500, &key("mid"))));

        ttl.remove(&key("mid"));
        assert_eq!(ttl.earliest(), Some((900, &key("late"))));
    }

    #[test]
    fn test_ttl_index_remove_unknown() {
        let mut ttl = TtlIndex::new();
        assert!(!ttl.remove(&key("missing")));
    }
}
