//! In-memory keyspace implementation
//!
//! One `KeyspaceStore` owns the key -> entry mapping for a single database
//! namespace. It is driven by exactly one writer at a time (the shard loop),
//! so it carries no internal locking; the only cross-keyspace state is the
//! pair of shared atomic counters (global memory usage, dirty counter).

use super::entry::Entry;
use super::glob::glob_match;
use super::index::{SampleSet, TtlIndex};
use super::value::{TypeTag, Value};
use bytes::Bytes;
use rand::Rng;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Type alias for our hash map with SipHasher
type StoreMap = HashMap<Bytes, Entry, BuildHasherDefault<SipHasher13>>;

/// Counters shared by every keyspace in the process.
#[derive(Debug, Clone, Default)]
pub struct SharedCounters {
    /// Estimated bytes used across all keyspaces; what eviction measures
    /// against the configured cap.
    pub mem_used: Arc<AtomicUsize>,

    /// Mutations since the last snapshot; what the persistence worker
    /// compares against the snapshot trigger threshold.
    pub dirty: Arc<AtomicU64>,
}

/// Remaining-TTL answer for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    /// Key does not exist (or is lazily expired).
    Missing,
    /// Key exists with no deadline.
    NoExpiry,
    /// Key exists; remaining milliseconds.
    RemainingMs(u64),
}

/// Statistics about one keyspace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyspaceStats {
    pub key_count: usize,
    pub used_bytes: usize,
    pub keys_with_ttl: usize,
    pub expired_total: u64,
    pub evicted_total: u64,
}

/// In-memory key-value store for one database namespace.
pub struct KeyspaceStore {
    /// The main storage map
    entries: StoreMap,

    /// Dense index of all keys (scan cursor, all-keys eviction sampling)
    keys: SampleSet,

    /// Deadline index of the keys carrying a TTL
    ttl: TtlIndex,

    shared: SharedCounters,

    /// Monotonic version source; never reused, so watch can rely on it
    version_clock: u64,

    /// Bytes attributed to this keyspace
    local_used: usize,

    /// LFU decay period in milliseconds
    lfu_decay_ms: u64,

    /// Keys removed by lazy expiry since the last drain; the shard loop
    /// turns these into journal deletes and mutation events.
    reaped: Vec<Bytes>,

    expired_total: u64,
    evicted_total: u64,
}

impl KeyspaceStore {
    pub fn new(shared: SharedCounters, lfu_decay_ms: u64) -> Self {
        KeyspaceStore {
            entries: StoreMap::with_capacity_and_hasher(
                1024,
                BuildHasherDefault::<SipHasher13>::default(),
            ),
            keys: SampleSet::new(),
            ttl: TtlIndex::new(),
            shared,
            version_clock: 0,
            local_used: 0,
            lfu_decay_ms,
            reaped: Vec::new(),
            expired_total: 0,
            evicted_total: 0,
        }
    }

    /// Standalone store with its own counters (tests, replay scaffolding).
    pub fn detached() -> Self {
        Self::new(SharedCounters::default(), 60_000)
    }

    // ── Lazy expiry ─────────────────────────────────────────────

    /// Physically remove `key` if its deadline has passed. The removal is
    /// buffered in the reap log for journal/event propagation.
    pub fn drop_if_expired(&mut self, key: &Bytes, now_ms: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(now_ms))
            .unwrap_or(false);
        if expired {
            self.remove_entry(key);
            self.reaped.push(key.clone());
            self.expired_total += 1;
            self.mark_dirty();
        }
        expired
    }

    /// Drain the keys removed by lazy expiry since the last call.
    pub fn take_reaped(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.reaped)
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Get a value by key; returns None if missing or expired. Touches the
    /// access metadata (recency + frequency).
    pub fn get(&mut self, key: &Bytes, now_ms: u64) -> Option<&Value> {
        self.drop_if_expired(key, now_ms);
        let decay = self.lfu_decay_ms;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now_ms, decay);
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Mutable value access, touching access metadata. Callers must follow
    /// an in-place mutation with [`KeyspaceStore::note_write`].
    pub fn get_mut(&mut self, key: &Bytes, now_ms: u64) -> Option<&mut Value> {
        self.drop_if_expired(key, now_ms);
        let decay = self.lfu_decay_ms;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now_ms, decay);
                Some(&mut entry.value)
            }
            None => None,
        }
    }

    /// Raw entry view without expiry handling or metadata updates
    /// (snapshot encoding, eviction candidate comparison).
    pub fn peek(&self, key: &Bytes) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn exists(&mut self, key: &Bytes, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        self.entries.contains_key(key)
    }

    pub fn type_of(&mut self, key: &Bytes, now_ms: u64) -> Option<TypeTag> {
        self.drop_if_expired(key, now_ms);
        self.entries.get(key).map(|entry| entry.value.type_tag())
    }

    /// Current entry version, for watch registration. `None` = absent.
    pub fn version_of(&mut self, key: &Bytes, now_ms: u64) -> Option<u64> {
        self.drop_if_expired(key, now_ms);
        self.entries.get(key).map(|entry| entry.version)
    }

    pub fn ttl_state(&mut self, key: &Bytes, now_ms: u64) -> TtlState {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            None => TtlState::Missing,
            Some(entry) => match entry.remaining_ms(now_ms) {
                None => TtlState::NoExpiry,
                Some(ms) => TtlState::RemainingMs(ms),
            },
        }
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Set a key, replacing any previous value and deadline.
    pub fn set(&mut self, key: Bytes, value: Value, expire_at: Option<u64>, now_ms: u64) {
        self.drop_if_expired(&key, now_ms);
        let version = self.next_version();
        let mut entry = Entry::with_deadline(value, expire_at, now_ms);
        entry.version = version;
        self.install(key, entry);
        self.mark_dirty();
    }

    /// Delete a key, returns true if a live key existed
    pub fn delete(&mut self, key: &Bytes, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        if self.remove_entry(key).is_some() {
            self.mark_dirty();
            true
        } else {
            false
        }
    }

    /// Swap in a new value only if the entry version still matches
    /// `expected` (`None` = expected absent). The deadline survives the
    /// swap. Returns false without touching anything on a version mismatch.
    pub fn compare_and_swap(
        &mut self,
        key: &Bytes,
        expected: Option<u64>,
        value: Value,
        now_ms: u64,
    ) -> bool {
        self.drop_if_expired(key, now_ms);
        let current = self.entries.get(key).map(|entry| entry.version);
        if current != expected {
            return false;
        }
        let expire_at = self.entries.get(key).and_then(|entry| entry.expire_at);
        let version = self.next_version();
        let mut entry = Entry::with_deadline(value, expire_at, now_ms);
        entry.version = version;
        self.install(key.clone(), entry);
        self.mark_dirty();
        true
    }

    /// Set an absolute deadline on an existing key. A deadline at or before
    /// `now_ms` removes the key immediately. Returns false if the key is
    /// absent.
    pub fn expire_at(&mut self, key: &Bytes, deadline: u64, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            return false;
        }
        if deadline <= now_ms {
            self.remove_entry(key);
            self.mark_dirty();
            return true;
        }
        let version = self.next_version();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expire_at = Some(deadline);
            entry.version = version;
        }
        self.ttl.set(key.clone(), deadline);
        self.mark_dirty();
        true
    }

    /// Remove the deadline from a key. Returns true if one was removed.
    pub fn persist_key(&mut self, key: &Bytes, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        let version = self.next_version();
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.expire_at.is_none() {
            return false;
        }
        entry.expire_at = None;
        entry.version = version;
        self.ttl.remove(key);
        self.mark_dirty();
        true
    }

    /// Mutable entry access for type-specific operations; expired entries
    /// are dropped first. Access metadata is not touched here (the caller
    /// decides whether the operation counts as an access).
    pub fn entry_mut(&mut self, key: &Bytes, now_ms: u64) -> Option<&mut Entry> {
        self.drop_if_expired(key, now_ms);
        self.entries.get_mut(key)
    }

    /// Settle an in-place value mutation: adjust the memory estimate by
    /// `delta` bytes, bump the entry version and mark the store dirty.
    pub fn note_write(&mut self, key: &Bytes, delta: isize) {
        let version = self.next_version();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.version = version;
        }
        if delta >= 0 {
            self.add_usage(delta as usize);
        } else {
            self.sub_usage(delta.unsigned_abs());
        }
        self.mark_dirty();
    }

    /// Remove all keys. Returns the number of keys dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.keys = SampleSet::new();
        self.ttl = TtlIndex::new();
        self.sub_usage(self.local_used);
        self.mark_dirty();
        dropped
    }

    // ── Scanning ────────────────────────────────────────────────

    /// Cursor-based key iteration with a bounded batch.
    ///
    /// The cursor is a position in the dense key index; `0` starts a scan
    /// and a returned cursor of `0` ends it. Keys present for the whole
    /// scan are returned; concurrent mutations may cause misses or
    /// repeats (swap-remove reordering). Expired keys encountered are
    /// reaped and filtered from the batch.
    pub fn scan(
        &mut self,
        cursor: u64,
        count: usize,
        pattern: Option<&Bytes>,
        now_ms: u64,
    ) -> (u64, Vec<Bytes>) {
        let batch = count.max(1);
        let mut pos = cursor as usize;
        let mut out = Vec::new();
        let mut expired = Vec::new();

        while pos < self.keys.len() && out.len() < batch {
            let Some(key) = self.keys.get(pos).cloned() else {
                break;
            };
            pos += 1;
            match self.entries.get(&key) {
                Some(entry) if entry.is_expired(now_ms) => expired.push(key),
                Some(_) => {
                    if pattern.map_or(true, |p| glob_match(p, &key)) {
                        out.push(key);
                    }
                }
                None => {}
            }
        }

        let next_cursor = if pos >= self.keys.len() { 0 } else { pos as u64 };
        for key in expired {
            self.drop_if_expired(&key, now_ms);
        }
        (next_cursor, out)
    }

    // ── Expiry / eviction support ───────────────────────────────

    /// Remove `key` if its deadline has passed (active sweep path).
    pub(crate) fn remove_if_expired(&mut self, key: &Bytes, now_ms: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(now_ms))
            .unwrap_or(false);
        if expired {
            self.remove_entry(key);
            self.expired_total += 1;
            self.mark_dirty();
        }
        expired
    }

    /// Forcibly remove a key to reclaim memory.
    pub(crate) fn remove_evicted(&mut self, key: &Bytes) -> bool {
        if self.remove_entry(key).is_some() {
            self.evicted_total += 1;
            self.mark_dirty();
            true
        } else {
            false
        }
    }

    /// Up to `n` distinct keys sampled uniformly from the whole keyspace.
    pub(crate) fn sample_keys<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<Bytes> {
        self.keys.sample(rng, n)
    }

    /// Up to `n` distinct keys sampled uniformly from the TTL index.
    pub(crate) fn sample_volatile<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<Bytes> {
        self.ttl.sample(rng, n)
    }

    /// The key with the nearest deadline, if any key carries one.
    pub(crate) fn shortest_ttl_key(&self) -> Option<Bytes> {
        self.ttl.earliest().map(|(_, key)| key.clone())
    }

    pub(crate) fn lfu_decay_ms(&self) -> u64 {
        self.lfu_decay_ms
    }

    // ── Introspection ───────────────────────────────────────────

    /// Number of keys, counting not-yet-reaped expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys_with_ttl(&self) -> usize {
        self.ttl.len()
    }

    /// Bytes attributed to this keyspace.
    pub fn used_bytes(&self) -> usize {
        self.local_used
    }

    /// Bytes used across all keyspaces sharing the counters.
    pub fn global_used_bytes(&self) -> usize {
        self.shared.mem_used.load(Ordering::Relaxed)
    }

    /// Iterate over raw entries (snapshot encoding, journal rewrite).
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Entry)> {
        self.entries.iter()
    }

    /// Get statistics about the store
    pub fn stats(&self, now_ms: u64) -> KeyspaceStats {
        let live = self
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .count();
        KeyspaceStats {
            key_count: live,
            used_bytes: self.local_used,
            keys_with_ttl: self.ttl.len(),
            expired_total: self.expired_total,
            evicted_total: self.evicted_total,
        }
    }

    // ── Internals ───────────────────────────────────────────────

    fn next_version(&mut self) -> u64 {
        self.version_clock += 1;
        self.version_clock
    }

    fn mark_dirty(&self) {
        self.shared.dirty.fetch_add(1, Ordering::Relaxed);
    }

    fn entry_cost(key: &Bytes, entry: &Entry) -> usize {
        key.len() + entry.memory_usage()
    }

    fn add_usage(&mut self, bytes: usize) {
        self.local_used += bytes;
        self.shared.mem_used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_usage(&mut self, bytes: usize) {
        self.local_used = self.local_used.saturating_sub(bytes);
        self.shared.mem_used.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn install(&mut self, key: Bytes, entry: Entry) {
        let cost = Self::entry_cost(&key, &entry);
        let deadline = entry.expire_at;
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.sub_usage(Self::entry_cost(&key, &old));
        } else {
            self.keys.insert(key.clone());
        }
        self.add_usage(cost);
        match deadline {
            Some(d) => self.ttl.set(key, d),
            None => {
                self.ttl.remove(&key);
            }
        }
    }

    fn remove_entry(&mut self, key: &Bytes) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.keys.remove(key);
        self.ttl.remove(key);
        self.sub_usage(Self::entry_cost(key, &entry));
        Some(entry)
    }
}
