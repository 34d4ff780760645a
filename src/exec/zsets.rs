//! Sorted-set operations (ZADD, ZREM, ZSCORE, ZCARD, ZRANGE)

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::Bytes;

pub(super) fn zadd(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    members: &[(f64, Bytes)],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::SortedSet, now_ms)?;
    if members.is_empty() {
        return Err(CoreError::InvalidArgument("no members to add".into()));
    }

    if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::empty_zset(), None, now_ms);
    }

    let zset = store
        .get_mut(key, now_ms)
        .and_then(Value::as_zset_mut)
        .unwrap();
    let mut added = 0i64;
    let mut delta = 0isize;
    for (score, member) in members {
        if zset.insert(member.clone(), *score) {
            added += 1;
            delta += (member.len() + std::mem::size_of::<f64>()) as isize;
        }
    }
    store.note_write(key, delta);

    let args: Vec<Bytes> = members
        .iter()
        .flat_map(|(score, member)| [JournalRecord::f64_arg(*score), member.clone()])
        .collect();
    fx.record(JournalOp::ZAdd, db, key.clone(), args);
    fx.event(key.clone(), OpKind::ZSetAdd);
    Ok(Reply::Integer(added))
}

pub(super) fn zrem(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    members: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::SortedSet, now_ms)?;

    let (removed, delta, emptied) = match store.get_mut(key, now_ms) {
        Some(value) => {
            let zset = value.as_zset_mut().ok_or(CoreError::TypeMismatch)?;
            let mut removed = 0i64;
            let mut delta = 0isize;
            for member in members {
                if zset.remove(member) {
                    removed += 1;
                    delta -= (member.len() + std::mem::size_of::<f64>()) as isize;
                }
            }
            (removed, delta, zset.is_empty())
        }
        None => return Ok(Reply::Integer(0)),
    };

    if removed == 0 {
        return Ok(Reply::Integer(0));
    }
    store.note_write(key, delta);
    if emptied {
        store.delete(key, now_ms);
    }

    fx.record(JournalOp::ZRem, db, key.clone(), members.to_vec());
    fx.event(key.clone(), OpKind::ZSetRem);
    if emptied {
        fx.event(key.clone(), OpKind::Del);
    }
    Ok(Reply::Integer(removed))
}

pub(super) fn zscore(
    store: &mut KeyspaceStore,
    key: &Bytes,
    member: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let zset = value.as_zset().ok_or(CoreError::TypeMismatch)?;
            Ok(zset.score(member).map(Reply::Double).unwrap_or(Reply::Nil))
        }
        None => Ok(Reply::Nil),
    }
}

pub(super) fn zcard(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_zset()
            .map(|z| Reply::Integer(z.len() as i64))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Integer(0)),
    }
}

pub(super) fn zrange(
    store: &mut KeyspaceStore,
    key: &Bytes,
    start: i64,
    stop: i64,
    with_scores: bool,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let ranked = match store.get(key, now_ms) {
        Some(value) => value.as_zset().ok_or(CoreError::TypeMismatch)?.ranked(),
        None => return Ok(Reply::Array(Vec::new())),
    };

    let len = ranked.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return Ok(Reply::Array(Vec::new()));
    }

    let slice = &ranked[start as usize..=(stop as usize)];
    let mut items = Vec::with_capacity(slice.len() * if with_scores { 2 } else { 1 });
    for (member, score) in slice {
        items.push(Reply::Bulk(member.clone()));
        if with_scores {
            items.push(Reply::Double(*score));
        }
    }
    Ok(Reply::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn scored(items: &[(f64, &str)]) -> Vec<(f64, Bytes)> {
        items.iter().map(|(s, m)| (*s, key(m))).collect()
    }

    #[test]
    fn test_zadd_and_update() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();

        let reply = zadd(
            &mut store,
            0,
            &key("z"),
            &scored(&[(1.0, "a"), (2.0, "b")]),
            0,
            &mut fx,
        )
        .unwrap();
        assert_eq!(reply, Reply::Integer(2));

        // Re-scoring an existing member adds nothing.
        let reply = zadd(&mut store, 0, &key("z"), &scored(&[(9.0, "a")]), 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(0));
        assert_eq!(
            zscore(&mut store, &key("z"), &key("a"), 0).unwrap(),
            Reply::Double(9.0)
        );
    }

    #[test]
    fn test_zrange_with_scores() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        zadd(
            &mut store,
            0,
            &key("z"),
            &scored(&[(3.0, "c"), (1.0, "a"), (2.0, "b")]),
            0,
            &mut fx,
        )
        .unwrap();

        let reply = zrange(&mut store, &key("z"), 0, -1, true, 0).unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::bulk("a"),
                Reply::Double(1.0),
                Reply::bulk("b"),
                Reply::Double(2.0),
                Reply::bulk("c"),
                Reply::Double(3.0),
            ])
        );

        let reply = zrange(&mut store, &key("z"), -2, -1, false, 0).unwrap();
        assert_eq!(reply, Reply::Array(vec![Reply::bulk("b"), Reply::bulk("c")]));
    }

    #[test]
    fn test_zrem_empty_cleanup() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        zadd(&mut store, 0, &key("z"), &scored(&[(1.0, "a")]), 0, &mut fx).unwrap();

        assert_eq!(
            zrem(&mut store, 0, &key("z"), &[key("a")], 0, &mut fx).unwrap(),
            Reply::Integer(1)
        );
        assert!(!store.exists(&key("z"), 0));
    }

    #[test]
    fn test_zscore_missing() {
        let mut store = KeyspaceStore::detached();
        assert_eq!(zscore(&mut store, &key("z"), &key("a"), 0).unwrap(), Reply::Nil);
        assert_eq!(zcard(&mut store, &key("z"), 0).unwrap(), Reply::Integer(0));
    }
}
