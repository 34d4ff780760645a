//! Memory-pressure eviction
//!
//! Runs immediately before a write is admitted. Approximate LRU/LFU avoid
//! any ordered bookkeeping: a small random sample of eligible keys is drawn
//! from the relevant index and the worst candidate is evicted, repeating
//! until the incoming write fits under the cap. Sample size is a tunable:
//! larger samples approximate true LRU/LFU more closely at higher CPU cost.

use crate::error::CoreError;
use crate::store::KeyspaceStore;
use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

/// What to do when a write would push memory usage above the cap.
///
/// `AllKeys*` policies consider every key; `Volatile*` policies only keys
/// carrying a TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum EvictionPolicy {
    /// Reject the write with an out-of-memory error.
    #[default]
    #[serde(rename = "noeviction", alias = "no-eviction")]
    NoEviction,

    /// Evict a uniformly random key.
    #[serde(rename = "allkeys-random")]
    AllKeysRandom,

    /// Evict a uniformly random key among those with a TTL.
    #[serde(rename = "volatile-random")]
    VolatileRandom,

    /// Sample keys, evict the least recently accessed.
    #[serde(rename = "allkeys-lru")]
    AllKeysLru,

    /// Sample TTL-carrying keys, evict the least recently accessed.
    #[serde(rename = "volatile-lru")]
    VolatileLru,

    /// Sample keys, evict the least frequently accessed (decayed counter).
    #[serde(rename = "allkeys-lfu")]
    AllKeysLfu,

    /// Sample TTL-carrying keys, evict the least frequently accessed.
    #[serde(rename = "volatile-lfu")]
    VolatileLfu,

    /// Evict the key with the nearest deadline (exact, via the TTL index).
    #[serde(rename = "volatile-ttl")]
    VolatileTtl,
}

impl EvictionPolicy {
    pub fn name(self) -> &'static str {
        match self {
            EvictionPolicy::NoEviction => "noeviction",
            EvictionPolicy::AllKeysRandom => "allkeys-random",
            EvictionPolicy::VolatileRandom => "volatile-random",
            EvictionPolicy::AllKeysLru => "allkeys-lru",
            EvictionPolicy::VolatileLru => "volatile-lru",
            EvictionPolicy::AllKeysLfu => "allkeys-lfu",
            EvictionPolicy::VolatileLfu => "volatile-lfu",
            EvictionPolicy::VolatileTtl => "volatile-ttl",
        }
    }

    fn volatile_scope(self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileRandom
                | EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu
                | EvictionPolicy::VolatileTtl
        )
    }
}

/// Make room for a write that is about to add `incoming` estimated bytes.
///
/// Evicts keys from `store` until global usage plus the incoming bytes fits
/// under `cap`, appending every victim to `evicted` so the caller can
/// propagate journal deletes and mutation events — including victims removed
/// before a failure. Fails with [`CoreError::OutOfMemory`] under
/// `noeviction`, or when the eligible scope runs dry before enough space is
/// reclaimed.
pub fn ensure_headroom<R: Rng>(
    store: &mut KeyspaceStore,
    incoming: usize,
    cap: Option<usize>,
    policy: EvictionPolicy,
    sample_size: usize,
    now_ms: u64,
    rng: &mut R,
    evicted: &mut Vec<Bytes>,
) -> Result<(), CoreError> {
    let Some(cap) = cap else {
        return Ok(());
    };

    while store.global_used_bytes() + incoming > cap {
        if policy == EvictionPolicy::NoEviction {
            return Err(CoreError::OutOfMemory);
        }
        let Some(victim) = pick_victim(store, policy, sample_size, now_ms, rng) else {
            return Err(CoreError::OutOfMemory);
        };
        if !store.remove_evicted(&victim) {
            // Sampled key vanished underneath us; only possible through
            // accounting drift, so bail rather than loop forever.
            return Err(CoreError::OutOfMemory);
        }
        debug!(key = ?victim, policy = policy.name(), "evicted key under memory pressure");
        evicted.push(victim);
    }
    Ok(())
}

fn pick_victim<R: Rng>(
    store: &KeyspaceStore,
    policy: EvictionPolicy,
    sample_size: usize,
    now_ms: u64,
    rng: &mut R,
) -> Option<Bytes> {
    let sample_size = sample_size.max(1);
    let candidates = if policy.volatile_scope() {
        store.sample_volatile(rng, sample_size)
    } else {
        store.sample_keys(rng, sample_size)
    };

    match policy {
        EvictionPolicy::NoEviction => None,
        EvictionPolicy::AllKeysRandom | EvictionPolicy::VolatileRandom => {
            candidates.into_iter().next()
        }
        EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru => candidates
            .into_iter()
            .min_by_key(|key| store.peek(key).map(|e| e.last_access_ms).unwrap_or(0)),
        EvictionPolicy::AllKeysLfu | EvictionPolicy::VolatileLfu => {
            let decay = store.lfu_decay_ms();
            candidates.into_iter().min_by_key(|key| {
                store
                    .peek(key)
                    .map(|e| e.decayed_freq(now_ms, decay))
                    .unwrap_or(0)
            })
        }
        EvictionPolicy::VolatileTtl => store.shortest_ttl_key(),
    }
}
