//! Active TTL expiration
//!
//! Passive expiry (drop-on-access) keeps reads correct but leaves keys that
//! are never touched again occupying memory. The active sweep reclaims those:
//! each cycle samples a bounded batch of keys from the TTL index, deletes the
//! expired ones, and repeats immediately while the expired fraction of the
//! batch stays above a threshold. CPU per cycle is bounded by
//! `batch * max_rounds`; memory is still reclaimed promptly when many keys
//! expire together. Keys without a TTL are never looked at.

use crate::store::KeyspaceStore;
use bytes::Bytes;
use rand::Rng;
use tracing::debug;

/// Upper bound on back-to-back rounds within one cycle.
const MAX_ROUNDS: usize = 16;

/// Result of one sweep cycle.
#[derive(Debug, Default)]
pub struct ExpireCycleOutcome {
    /// Keys sampled across all rounds
    pub sampled: usize,

    /// Rounds executed (>= 1 unless the TTL index was empty)
    pub rounds: usize,

    /// Keys physically removed; the caller propagates these as deletes
    /// (journal + mutation events)
    pub removed: Vec<Bytes>,
}

/// Run one active expiry cycle against a keyspace.
///
/// `batch` keys are sampled per round; the cycle repeats while the expired
/// fraction of a round exceeds `repeat_fraction`, up to [`MAX_ROUNDS`].
pub fn run_expire_cycle<R: Rng>(
    store: &mut KeyspaceStore,
    now_ms: u64,
    batch: usize,
    repeat_fraction: f64,
    rng: &mut R,
) -> ExpireCycleOutcome {
    let mut outcome = ExpireCycleOutcome::default();
    if batch == 0 {
        return outcome;
    }

    loop {
        if store.keys_with_ttl() == 0 || outcome.rounds >= MAX_ROUNDS {
            break;
        }

        let sample = store.sample_volatile(rng, batch);
        if sample.is_empty() {
            break;
        }

        let sampled = sample.len();
        let mut removed_this_round = 0usize;
        for key in sample {
            if store.remove_if_expired(&key, now_ms) {
                removed_this_round += 1;
                outcome.removed.push(key);
            }
        }

        outcome.sampled += sampled;
        outcome.rounds += 1;

        let fraction = removed_this_round as f64 / sampled as f64;
        if fraction <= repeat_fraction {
            break;
        }
    }

    if !outcome.removed.is_empty() {
        debug!(
            removed = outcome.removed.len(),
            sampled = outcome.sampled,
            rounds = outcome.rounds,
            "active expiry cycle reclaimed keys"
        );
    }
    outcome
}
