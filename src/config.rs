//! Engine configuration
//!
//! The configuration is owned by the embedding layer and handed to
//! [`crate::engine::Engine::open`] as an immutable struct. All fields carry
//! defaults so a partial document deserializes cleanly.

use crate::eviction::EvictionPolicy;
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Number of independent database namespaces.
    pub databases: usize,

    /// Global memory cap in bytes across all databases. `None` = unlimited.
    pub max_memory: Option<usize>,

    /// What to do when a write would push usage above the cap.
    pub eviction_policy: EvictionPolicy,

    /// Keys sampled per approximate-LRU/LFU eviction round. Larger samples
    /// trade CPU for accuracy.
    pub eviction_sample_size: usize,

    /// LFU frequency counters lose one point per elapsed period of this
    /// many minutes, applied lazily on access.
    pub lfu_decay_minutes: u64,

    /// Interval between active expiry sweeps, per database.
    pub expiry_interval_ms: u64,

    /// Keys sampled from the TTL index per sweep round.
    pub expiry_batch_size: usize,

    /// A sweep round repeats immediately while the expired fraction of its
    /// batch exceeds this threshold.
    pub expiry_repeat_fraction: f64,

    /// Snapshot persistence settings.
    pub snapshot: SnapshotConfig,

    /// Journal persistence settings.
    pub journal: JournalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            databases: 16,
            max_memory: None,
            eviction_policy: EvictionPolicy::NoEviction,
            eviction_sample_size: 5,
            lfu_decay_minutes: 1,
            expiry_interval_ms: 100,
            expiry_batch_size: 20,
            expiry_repeat_fraction: 0.25,
            snapshot: SnapshotConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

/// Snapshot trigger and placement settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotConfig {
    /// Enable automatic and explicit snapshots.
    pub enabled: bool,

    /// Path of the snapshot file. The previous snapshot is rotated to
    /// `<path>.bak` and kept as the corruption fallback.
    pub path: PathBuf,

    /// Automatic trigger: at least this many mutations...
    pub dirty_threshold: u64,

    /// ...within this window, checked by the persistence worker.
    pub window_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            enabled: true,
            path: PathBuf::from("forgedb.snapshot"),
            dirty_threshold: 1000,
            window_secs: 60,
        }
    }
}

/// Journal durability levels.
///
/// The level bounds how much acknowledged data a crash can lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalSync {
    /// fsync after every record. Safest, slowest.
    Always,
    /// fsync at most once per this many seconds.
    EverySecs(u64),
    /// Let the OS flush its buffers when it pleases.
    OsBuffered,
}

impl Default for JournalSync {
    fn default() -> Self {
        JournalSync::EverySecs(1)
    }
}

/// Journal settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct JournalConfig {
    /// Enable the append-only journal.
    pub enabled: bool,

    /// Path of the journal file.
    pub path: PathBuf,

    /// Durability level.
    pub sync: JournalSync,

    /// Rewrite only once the journal is at least this large.
    pub rewrite_min_bytes: u64,

    /// Rewrite once the journal has grown past this multiple of its size
    /// after the previous rewrite.
    pub rewrite_growth: f64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            enabled: true,
            path: PathBuf::from("forgedb.journal"),
            sync: JournalSync::default(),
            rewrite_min_bytes: 64 * 1024 * 1024,
            rewrite_growth: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.databases, 16);
        assert_eq!(cfg.eviction_sample_size, 5);
        assert_eq!(cfg.eviction_policy, EvictionPolicy::NoEviction);
        assert!(cfg.journal.enabled);
    }

    #[test]
    fn test_deserialize_partial_document() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "databases": 4,
                "max-memory": 1048576,
                "eviction-policy": "allkeys-lru",
                "journal": { "sync": { "every-secs": 5 } }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.databases, 4);
        assert_eq!(cfg.max_memory, Some(1_048_576));
        assert_eq!(cfg.eviction_policy, EvictionPolicy::AllKeysLru);
        assert_eq!(cfg.journal.sync, JournalSync::EverySecs(5));
        // Untouched sections keep their defaults
        assert_eq!(cfg.snapshot.dirty_threshold, 1000);
    }

    #[test]
    fn test_policy_names_are_kebab_case() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "eviction-policy": "volatile-ttl" }"#).unwrap();
        assert_eq!(cfg.eviction_policy, EvictionPolicy::VolatileTtl);
    }
}
