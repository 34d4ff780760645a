//! Optimistic transactions
//!
//! A transaction is a watch set plus a queue of operations. Watch
//! registration captures the current entry version of each key (`None` for
//! an absent key); commit re-validates every captured version inside the
//! shard loop and aborts on any drift — versions come from a monotonic
//! per-keyspace clock, so delete + recreate can never masquerade as
//! "unchanged". Queue-time type mismatches poison the whole transaction
//! before anything runs. A type mismatch that only surfaces *during* commit
//! execution does not roll back the operations already applied; the error
//! is embedded in the reply vector. That no-rollback behavior is
//! deliberate and load-bearing.

use super::{Command, Effects, Reply};
use crate::error::CoreError;
use crate::store::KeyspaceStore;
use bytes::Bytes;
use rand::Rng;

/// Client-held transaction state between watch and commit.
#[derive(Debug)]
pub struct WatchHandle {
    pub(crate) db_index: usize,
    /// Key -> version observed at watch time (`None` = absent)
    pub(crate) watched: Vec<(Bytes, Option<u64>)>,
    pub(crate) queued: Vec<Command>,
    /// First queue-time error; set once, aborts the commit
    pub(crate) poisoned: Option<CoreError>,
}

impl WatchHandle {
    pub(crate) fn new(db_index: usize, watched: Vec<(Bytes, Option<u64>)>) -> Self {
        WatchHandle {
            db_index,
            watched,
            queued: Vec::new(),
            poisoned: None,
        }
    }

    pub fn db_index(&self) -> usize {
        self.db_index
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }
}

/// Capture the current versions of `keys` for a watch registration.
pub(crate) fn capture_versions(
    store: &mut KeyspaceStore,
    keys: &[Bytes],
    now_ms: u64,
) -> Vec<(Bytes, Option<u64>)> {
    keys.iter()
        .map(|key| (key.clone(), store.version_of(key, now_ms)))
        .collect()
}

/// True when every watched key still carries the version captured at watch
/// time. A lazily-expired key reads as absent, which correctly conflicts
/// with a watch that saw it present.
pub(crate) fn watches_intact(
    store: &mut KeyspaceStore,
    watched: &[(Bytes, Option<u64>)],
    now_ms: u64,
) -> bool {
    watched
        .iter()
        .all(|(key, version)| store.version_of(key, now_ms) == *version)
}

/// Run the queued operations back-to-back. Nothing else interleaves (the
/// shard loop is single-writer); failed operations leave their slot as
/// [`Reply::Error`] and execution continues — no rollback.
pub(crate) fn execute_queued<R: Rng>(
    store: &mut KeyspaceStore,
    db: u32,
    ops: &[Command],
    now_ms: u64,
    rng: &mut R,
    fx: &mut Effects,
) -> Vec<Reply> {
    ops.iter()
        .map(|cmd| match super::apply(store, db, cmd, now_ms, rng, fx) {
            Ok(reply) => reply,
            Err(err) => Reply::Error(err),
        })
        .collect()
}
