//! Mutation event hook
//!
//! The external pub/sub layer plugs in here. The hook is invoked
//! synchronously in the shard loop after each successful mutation (including
//! expirations and evictions); the core does not implement delivery, so
//! implementations must hand off quickly.

use crate::exec::OpKind;
use bytes::Bytes;

/// Observer of keyspace mutations.
pub trait KeyEventListener: Send + Sync {
    fn on_key_mutated(&self, db_index: usize, key: &Bytes, op: OpKind);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects events for assertions.
    #[derive(Default)]
    pub struct RecordingListener {
        pub seen: Mutex<Vec<(usize, Bytes, OpKind)>>,
    }

    impl KeyEventListener for RecordingListener {
        fn on_key_mutated(&self, db_index: usize, key: &Bytes, op: OpKind) {
            self.seen
                .lock()
                .unwrap()
                .push((db_index, key.clone(), op));
        }
    }
}
