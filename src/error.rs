//! Error taxonomy surfaced by the engine
//!
//! Lazy-expired keys are never an error: absence is reported as a normal
//! miss. Persistence write failures degrade durability instead of failing
//! the command that triggered them.

use thiserror::Error;

/// Errors surfaced to callers of [`crate::engine::Engine`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Operation applied to a key holding an incompatible value type.
    #[error("WRONGTYPE operation against a key holding the wrong kind of value")]
    TypeMismatch,

    /// Write rejected: memory cap reached and the policy refuses (or fails)
    /// to reclaim enough space.
    #[error("OOM command not allowed when used memory > 'max-memory'")]
    OutOfMemory,

    /// Optimistic transaction aborted because a watched key changed.
    #[error("transaction aborted: a watched key was modified")]
    WatchConflict,

    /// Snapshot or journal I/O failed at the storage layer.
    #[error("persistence I/O error: {0}")]
    PersistenceIo(String),

    /// Checksum or parse failure while loading persisted state.
    #[error("corrupted persistence data: {0}")]
    Corruption(String),

    /// String payload is not a well-formed 64-bit integer.
    #[error("value is not an integer or out of range")]
    NotInteger,

    /// Malformed operation arguments (bad range, bad id, zero count, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Database index outside the configured range.
    #[error("no such database: {0}")]
    NoSuchDatabase(usize),

    /// The engine is shutting down and no longer accepts requests.
    #[error("engine is closed")]
    EngineClosed,
}

impl CoreError {
    pub(crate) fn io(err: std::io::Error) -> Self {
        CoreError::PersistenceIo(err.to_string())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        CoreError::Corruption(msg.into())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::io(err)
    }
}
