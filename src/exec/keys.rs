//! Generic key operations (DEL, EXISTS, TYPE, expiry control, SCAN)

use super::{Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TtlState};
use bytes::Bytes;

pub(super) fn del(
    store: &mut KeyspaceStore,
    db: u32,
    keys: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    let mut removed = 0;
    for key in keys {
        if store.delete(key, now_ms) {
            removed += 1;
            fx.record(JournalOp::Del, db, key.clone(), Vec::new());
            fx.event(key.clone(), OpKind::Del);
        }
    }
    Ok(Reply::Integer(removed))
}

pub(super) fn exists(
    store: &mut KeyspaceStore,
    keys: &[Bytes],
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let count = keys.iter().filter(|key| store.exists(key, now_ms)).count();
    Ok(Reply::Integer(count as i64))
}

pub(super) fn type_of(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.type_of(key, now_ms) {
        Some(tag) => Ok(Reply::bulk(tag.name())),
        None => Ok(Reply::Nil),
    }
}

/// Shared EXPIRE / EXPIREAT path; a deadline in the past deletes the key.
pub(super) fn expire_at(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    deadline_ms: u64,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    if !store.expire_at(key, deadline_ms, now_ms) {
        return Ok(Reply::Integer(0));
    }
    if deadline_ms <= now_ms {
        fx.record(JournalOp::Del, db, key.clone(), Vec::new());
        fx.event(key.clone(), OpKind::Del);
    } else {
        fx.record(
            JournalOp::ExpireAt,
            db,
            key.clone(),
            vec![JournalRecord::u64_arg(deadline_ms)],
        );
        fx.event(key.clone(), OpKind::Expire);
    }
    Ok(Reply::Integer(1))
}

pub(super) fn persist(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    if store.persist_key(key, now_ms) {
        fx.record(JournalOp::Persist, db, key.clone(), Vec::new());
        fx.event(key.clone(), OpKind::Persist);
        Ok(Reply::Integer(1))
    } else {
        Ok(Reply::Integer(0))
    }
}

/// Remaining TTL in seconds, rounded up.
/// Returns -1 without a deadline and -2 for a missing key.
pub(super) fn ttl(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let reply = match store.ttl_state(key, now_ms) {
        TtlState::Missing => Reply::Integer(-2),
        TtlState::NoExpiry => Reply::Integer(-1),
        TtlState::RemainingMs(ms) => Reply::Integer(((ms + 999) / 1000) as i64),
    };
    Ok(reply)
}

pub(super) fn scan(
    store: &mut KeyspaceStore,
    cursor: u64,
    count: usize,
    pattern: Option<&Bytes>,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let (next, keys) = store.scan(cursor, count, pattern, now_ms);
    Ok(Reply::Scan { next, keys })
}

pub(super) fn flush_db(
    store: &mut KeyspaceStore,
    db: u32,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    store.flush();
    fx.record(JournalOp::FlushDb, db, Bytes::new(), Vec::new());
    fx.event(Bytes::new(), OpKind::Flush);
    Ok(Reply::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_del_counts_and_journals_existing_only() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        store.set(key("a"), Value::str("1"), None, 0);
        store.set(key("b"), Value::str("2"), None, 0);

        let reply = del(&mut store, 0, &[key("a"), key("missing"), key("b")], 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(2));
        assert_eq!(fx.journal.len(), 2);
    }

    #[test]
    fn test_expire_past_deadline_deletes_and_journals_del() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        store.set(key("k"), Value::str("v"), None, 0);

        let reply = expire_at(&mut store, 0, &key("k"), 500, 1000, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert!(!store.exists(&key("k"), 1000));
        assert_eq!(fx.journal[0].op, JournalOp::Del);
    }

    #[test]
    fn test_expire_future_journals_absolute_deadline() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        store.set(key("k"), Value::str("v"), None, 0);

        expire_at(&mut store, 0, &key("k"), 9000, 1000, &mut fx).unwrap();
        assert_eq!(fx.journal[0].op, JournalOp::ExpireAt);
        assert_eq!(JournalRecord::parse_u64(&fx.journal[0].args[0]), Some(9000));
    }

    #[test]
    fn test_ttl_reply_values() {
        let mut store = KeyspaceStore::detached();
        store.set(key("plain"), Value::str("v"), None, 0);
        store.set(key("timed"), Value::str("v"), Some(2500), 0);

        assert_eq!(ttl(&mut store, &key("missing"), 0).unwrap(), Reply::Integer(-2));
        assert_eq!(ttl(&mut store, &key("plain"), 0).unwrap(), Reply::Integer(-1));
        // 2500 ms rounds up to 3 seconds.
        assert_eq!(ttl(&mut store, &key("timed"), 0).unwrap(), Reply::Integer(3));
    }

    #[test]
    fn test_flush_db() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        store.set(key("a"), Value::str("1"), None, 0);

        assert_eq!(flush_db(&mut store, 0, &mut fx).unwrap(), Reply::Ok);
        assert!(store.is_empty());
        assert_eq!(fx.journal[0].op, JournalOp::FlushDb);
    }
}
