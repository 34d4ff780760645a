//! List operations (LPUSH, RPUSH, LPOP, RPOP, LRANGE, LLEN, BLPOP)
//!
//! An emptied list deletes its key, and pops journal the actual popped
//! count so replay shrinks the list identically.

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::Bytes;

pub(super) fn push(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    values: &[Bytes],
    front: bool,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::List, now_ms)?;
    if values.is_empty() {
        return Err(CoreError::InvalidArgument("no values to push".into()));
    }

    if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::empty_list(), None, now_ms);
    }

    let added: usize = values.iter().map(|v| v.len()).sum();
    let list = store
        .get_mut(key, now_ms)
        .and_then(Value::as_list_mut)
        .unwrap();
    for value in values {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    let len = list.len();
    store.note_write(key, added as isize);

    let op = if front { JournalOp::LPush } else { JournalOp::RPush };
    fx.record(op, db, key.clone(), values.to_vec());
    fx.event(key.clone(), OpKind::ListPush);
    Ok(Reply::Integer(len as i64))
}

pub(crate) fn pop(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    front: bool,
    count: Option<usize>,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::List, now_ms)?;

    let single = count.is_none();
    let requested = count.unwrap_or(1);
    let empty_reply = || if single { Reply::Nil } else { Reply::Array(Vec::new()) };
    if requested == 0 {
        return Ok(empty_reply());
    }

    let (popped, emptied) = match store.get_mut(key, now_ms) {
        Some(value) => {
            let list = value.as_list_mut().ok_or(CoreError::TypeMismatch)?;
            let mut popped = Vec::with_capacity(requested.min(list.len()));
            for _ in 0..requested {
                let item = if front { list.pop_front() } else { list.pop_back() };
                match item {
                    Some(item) => popped.push(item),
                    None => break,
                }
            }
            (popped, list.is_empty())
        }
        None => return Ok(empty_reply()),
    };

    if popped.is_empty() {
        return Ok(empty_reply());
    }

    let freed: usize = popped.iter().map(|b| b.len()).sum();
    store.note_write(key, -(freed as isize));
    if emptied {
        store.delete(key, now_ms);
    }

    let op = if front { JournalOp::LPop } else { JournalOp::RPop };
    fx.record(
        op,
        db,
        key.clone(),
        vec![JournalRecord::u64_arg(popped.len() as u64)],
    );
    fx.event(key.clone(), OpKind::ListPop);
    if emptied {
        fx.event(key.clone(), OpKind::Del);
    }

    if single {
        Ok(popped.into_iter().next().map(Reply::Bulk).unwrap_or(Reply::Nil))
    } else {
        Ok(Reply::bulk_array(popped))
    }
}

pub(super) fn range(
    store: &mut KeyspaceStore,
    key: &Bytes,
    start: i64,
    stop: i64,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let list = match store.get(key, now_ms) {
        Some(value) => value.as_list().ok_or(CoreError::TypeMismatch)?,
        None => return Ok(Reply::Array(Vec::new())),
    };

    let len = list.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || start > stop {
        return Ok(Reply::Array(Vec::new()));
    }

    let items: Vec<Bytes> = list
        .iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .cloned()
        .collect();
    Ok(Reply::bulk_array(items))
}

pub(super) fn llen(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_list()
            .map(|l| Reply::Integer(l.len() as i64))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Integer(0)),
    }
}

/// Immediate attempt of a blocking head pop.
///
/// `Ok(None)` means the list is empty or absent: the shard loop registers
/// the caller in the wait registry instead. A successful pop replies
/// `[key, value]` like its blocking form.
pub(crate) fn blpop_try(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Option<Reply>, CoreError> {
    match pop(store, db, key, true, None, now_ms, fx)? {
        Reply::Nil => Ok(None),
        Reply::Bulk(value) => Ok(Some(Reply::Array(vec![
            Reply::Bulk(key.clone()),
            Reply::Bulk(value),
        ]))),
        other => Ok(Some(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn values(items: &[&str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::from(s.to_string())).collect()
    }

    #[test]
    fn test_push_order() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();

        // LPUSH l a b c leaves c, b, a; RPUSH appends.
        push(&mut store, 0, &key("l"), &values(&["a", "b", "c"]), true, 0, &mut fx).unwrap();
        push(&mut store, 0, &key("l"), &values(&["z"]), false, 0, &mut fx).unwrap();

        let reply = range(&mut store, &key("l"), 0, -1, 0).unwrap();
        assert_eq!(
            reply,
            Reply::bulk_array(values(&["c", "b", "a", "z"]))
        );
    }

    #[test]
    fn test_pop_single_and_counted() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        push(&mut store, 0, &key("l"), &values(&["a", "b", "c"]), false, 0, &mut fx).unwrap();

        assert_eq!(
            pop(&mut store, 0, &key("l"), true, None, 0, &mut fx).unwrap(),
            Reply::bulk("a")
        );
        assert_eq!(
            pop(&mut store, 0, &key("l"), false, Some(5), 0, &mut fx).unwrap(),
            Reply::bulk_array(values(&["c", "b"]))
        );
        // Drained list deletes the key.
        assert!(!store.exists(&key("l"), 0));
    }

    #[test]
    fn test_pop_journals_actual_count() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        push(&mut store, 0, &key("l"), &values(&["a", "b"]), false, 0, &mut fx).unwrap();
        fx.journal.clear();

        pop(&mut store, 0, &key("l"), false, Some(10), 0, &mut fx).unwrap();
        assert_eq!(fx.journal.len(), 1);
        assert_eq!(fx.journal[0].op, JournalOp::RPop);
        assert_eq!(JournalRecord::parse_u64(&fx.journal[0].args[0]), Some(2));
    }

    #[test]
    fn test_pop_missing_key() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        assert_eq!(
            pop(&mut store, 0, &key("none"), true, None, 0, &mut fx).unwrap(),
            Reply::Nil
        );
        assert_eq!(
            pop(&mut store, 0, &key("none"), true, Some(3), 0, &mut fx).unwrap(),
            Reply::Array(Vec::new())
        );
        assert!(fx.journal.is_empty());
    }

    #[test]
    fn test_range_negative_indexes() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        push(&mut store, 0, &key("l"), &values(&["a", "b", "c", "d"]), false, 0, &mut fx).unwrap();

        assert_eq!(
            range(&mut store, &key("l"), -2, -1, 0).unwrap(),
            Reply::bulk_array(values(&["c", "d"]))
        );
        assert_eq!(
            range(&mut store, &key("l"), 2, 100, 0).unwrap(),
            Reply::bulk_array(values(&["c", "d"]))
        );
        assert_eq!(
            range(&mut store, &key("l"), 3, 1, 0).unwrap(),
            Reply::Array(Vec::new())
        );
    }

    #[test]
    fn test_blpop_try() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();

        assert!(blpop_try(&mut store, 0, &key("q"), 0, &mut fx).unwrap().is_none());

        push(&mut store, 0, &key("q"), &values(&["job"]), false, 0, &mut fx).unwrap();
        let reply = blpop_try(&mut store, 0, &key("q"), 0, &mut fx).unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::bulk("q"), Reply::bulk("job")])
        );
    }

    #[test]
    fn test_wrong_type() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        store.set(key("s"), Value::str("x"), None, 0);

        assert_eq!(
            push(&mut store, 0, &key("s"), &values(&["a"]), true, 0, &mut fx).unwrap_err(),
            CoreError::TypeMismatch
        );
        assert_eq!(
            llen(&mut store, &key("s"), 0).unwrap_err(),
            CoreError::TypeMismatch
        );
    }
}
