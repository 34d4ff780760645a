//! Dual-mode persistence
//!
//! Two independent, composable mechanisms:
//!
//! - **Journal**: every successful mutating command appends one checksummed
//!   binary record; startup replays the valid prefix. Rewritten/compacted
//!   once it outgrows its post-rewrite size.
//! - **Snapshot**: a checksummed point-in-time blob of every database,
//!   written through a temp file with the previous snapshot kept as a
//!   `.bak` fallback.

mod reader;
mod record;
pub(crate) mod replay;
mod rewrite;
pub(crate) mod snapshot;
mod writer;

pub use reader::{JournalReader, JournalScan};
pub use record::{JournalOp, JournalRecord, RecordError};
pub use replay::replay_into;
pub use rewrite::rewrite_records;
pub use snapshot::{load_snapshot, load_with_fallback, SnapshotEntry, SnapshotSection};
pub use writer::JournalWriter;
