//! Wait registry for blocking operations
//!
//! A blocking pop that finds nothing registers interest against its key;
//! the shard loop resumes waiters FIFO when a write lands on that key.
//! Cancellation (timeout at the engine boundary) removes the registration
//! and resolves the waiter with an empty result.

use crate::error::CoreError;
use crate::exec::Reply;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// One parked blocking request.
pub(crate) struct Waiter {
    pub id: u64,
    pub tx: oneshot::Sender<Result<Reply, CoreError>>,
}

#[derive(Default)]
pub(crate) struct WaitRegistry {
    by_key: HashMap<Bytes, VecDeque<Waiter>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        WaitRegistry::default()
    }

    pub fn register(&mut self, key: Bytes, waiter: Waiter) {
        self.by_key.entry(key).or_default().push_back(waiter);
    }

    /// Put a waiter back at the head of its queue (it was popped but the
    /// list turned out to be empty again).
    pub fn register_front(&mut self, key: Bytes, waiter: Waiter) {
        self.by_key.entry(key).or_default().push_front(waiter);
    }

    pub fn has_waiters(&self, key: &Bytes) -> bool {
        self.by_key.get(key).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Longest-waiting registration for `key`.
    pub fn pop_waiter(&mut self, key: &Bytes) -> Option<Waiter> {
        let queue = self.by_key.get_mut(key)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.by_key.remove(key);
        }
        waiter
    }

    /// Remove a registration by id, wherever it is queued.
    pub fn cancel(&mut self, id: u64) -> Option<Waiter> {
        let mut found_key: Option<Bytes> = None;
        let mut found: Option<Waiter> = None;

        for (key, queue) in self.by_key.iter_mut() {
            if let Some(index) = queue.iter().position(|w| w.id == id) {
                found = queue.remove(index);
                if queue.is_empty() {
                    found_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = found_key {
            self.by_key.remove(&key);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(id: u64) -> (Waiter, oneshot::Receiver<Result<Reply, CoreError>>) {
        let (tx, rx) = oneshot::channel();
        (Waiter { id, tx }, rx)
    }

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_fifo_order() {
        let mut registry = WaitRegistry::new();
        let (w1, _rx1) = waiter(1);
        let (w2, _rx2) = waiter(2);
        registry.register(key("k"), w1);
        registry.register(key("k"), w2);

        assert_eq!(registry.pop_waiter(&key("k")).unwrap().id, 1);
        assert_eq!(registry.pop_waiter(&key("k")).unwrap().id, 2);
        assert!(registry.pop_waiter(&key("k")).is_none());
        assert!(!registry.has_waiters(&key("k")));
    }

    #[test]
    fn test_register_front_restores_priority() {
        let mut registry = WaitRegistry::new();
        let (w1, _rx1) = waiter(1);
        let (w2, _rx2) = waiter(2);
        registry.register(key("k"), w1);
        registry.register(key("k"), w2);

        let first = registry.pop_waiter(&key("k")).unwrap();
        registry.register_front(key("k"), first);
        assert_eq!(registry.pop_waiter(&key("k")).unwrap().id, 1);
    }

    #[test]
    fn test_cancel_by_id() {
        let mut registry = WaitRegistry::new();
        let (w1, _rx1) = waiter(7);
        registry.register(key("k"), w1);

        assert_eq!(registry.cancel(7).unwrap().id, 7);
        assert!(registry.cancel(7).is_none());
        assert!(!registry.has_waiters(&key("k")));
    }
}
