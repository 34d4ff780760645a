//! ForgeDB - a typed in-memory key-value engine
//!
//! ForgeDB is the storage core only: keyspaces with TTL expiry, memory-cap
//! eviction, dual-mode persistence (point-in-time snapshots + append-only
//! journal) and an optimistic-transaction executor. Wire protocols, CLI,
//! configuration loading, authentication and pub/sub delivery are external
//! collaborators that talk to [`engine::Engine`].
//!
//! Design principles carried throughout:
//! - Each module has a single, well-defined responsibility
//! - Modules communicate through clear, minimal interfaces
//! - Every engine instance is explicitly constructed and injectable; there
//!   is no process-wide global state

mod clock;

pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod exec;
pub mod expiry;
pub mod persist;
pub mod store;

/// Re-export commonly used types
pub use config::{EngineConfig, JournalConfig, JournalSync, SnapshotConfig};
pub use engine::{Engine, EngineStats, KeyEventListener};
pub use error::CoreError;
pub use eviction::EvictionPolicy;
pub use exec::txn::WatchHandle;
pub use exec::{Command, OpKind, Reply};
pub use store::{KeyspaceStats, KeyspaceStore, TypeTag, Value};
