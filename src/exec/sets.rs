//! Set operations (SADD, SREM, SPOP, SMEMBERS, SISMEMBER, SCARD)
//!
//! SPOP chooses its victims randomly but journals the resolved members as
//! an SREM, keeping replay deterministic.

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::JournalOp;
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::Bytes;
use rand::seq::IteratorRandom;
use rand::Rng;

pub(super) fn sadd(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    members: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Set, now_ms)?;
    if members.is_empty() {
        return Err(CoreError::InvalidArgument("no members to add".into()));
    }

    if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::empty_set(), None, now_ms);
    }

    let set = store
        .get_mut(key, now_ms)
        .and_then(Value::as_set_mut)
        .unwrap();
    let mut added = 0i64;
    let mut delta = 0isize;
    for member in members {
        if set.insert(member.clone()) {
            added += 1;
            delta += member.len() as isize;
        }
    }
    store.note_write(key, delta);

    fx.record(JournalOp::SAdd, db, key.clone(), members.to_vec());
    fx.event(key.clone(), OpKind::SetAdd);
    Ok(Reply::Integer(added))
}

pub(super) fn srem(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    members: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Set, now_ms)?;

    let (removed, delta, emptied) = match store.get_mut(key, now_ms) {
        Some(value) => {
            let set = value.as_set_mut().ok_or(CoreError::TypeMismatch)?;
            let mut removed = 0i64;
            let mut delta = 0isize;
            for member in members {
                if set.remove(member) {
                    removed += 1;
                    delta -= member.len() as isize;
                }
            }
            (removed, delta, set.is_empty())
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

    fx.record(JournalOp::SRem, db, key.clone(), members.to_vec());
    fx.event(key.clone(), OpKind::SetRem);
    if emptied {
        fx.event(key.clone(), OpKind::Del);
    }
    Ok(Reply::Integer(removed))
}

pub(super) fn spop<R: Rng>(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    count: usize,
    now_ms: u64,
    rng: &mut R,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Set, now_ms)?;
    if count == 0 {
        return Ok(Reply::Array(Vec::new()));
    }

    let (chosen, delta, emptied) = match store.get_mut(key, now_ms) {
        Some(value) => {
            let set = value.as_set_mut().ok_or(CoreError::TypeMismatch)?;
            let chosen: Vec<Bytes> = if count >= set.len() {
                set.iter().cloned().collect()
            } else {
                set.iter().cloned().choose_multiple(rng, count)
            };
            let mut delta = 0isize;
            for member in &chosen {
                set.remove(member);
                delta -= member.len() as isize;
            }
            (chosen, delta, set.is_empty())
        }
        None => return Ok(Reply::Array(Vec::new())),
    };

    if chosen.is_empty() {
        return Ok(Reply::Array(Vec::new()));
    }
    store.note_write(key, delta);
    if emptied {
        store.delete(key, now_ms);
    }

    // Journaled as the removal of the members actually chosen.
    fx.record(JournalOp::SRem, db, key.clone(), chosen.clone());
    fx.event(key.clone(), OpKind::SetPop);
    if emptied {
        fx.event(key.clone(), OpKind::Del);
    }
    Ok(Reply::bulk_array(chosen))
}

pub(super) fn smembers(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let set = value.as_set().ok_or(CoreError::TypeMismatch)?;
            Ok(Reply::bulk_array(set.iter().cloned().collect::<Vec<_>>()))
        }
        None => Ok(Reply::Array(Vec::new())),
    }
}

pub(super) fn sismember(
    store: &mut KeyspaceStore,
    key: &Bytes,
    member: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let set = value.as_set().ok_or(CoreError::TypeMismatch)?;
            Ok(Reply::Integer(i64::from(set.contains(member))))
        }
        None => Ok(Reply::Integer(0)),
    }
}

pub(super) fn scard(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_set()
            .map(|s| Reply::Integer(s.len() as i64))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Integer(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn members(items: &[&str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::from(s.to_string())).collect()
    }

    #[test]
    fn test_sadd_dedup() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();

        let reply = sadd(&mut store, 0, &key("s"), &members(&["a", "b", "c"]), 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(3));

        let reply = sadd(&mut store, 0, &key("s"), &members(&["b", "c", "d"]), 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert_eq!(scard(&mut store, &key("s"), 0).unwrap(), Reply::Integer(4));
    }

    #[test]
    fn test_spop_drains_small_set_entirely() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        let mut rng = rand::rng();
        sadd(&mut store, 0, &key("s"), &members(&["a", "b", "c"]), 0, &mut fx).unwrap();

        let reply = spop(&mut store, 0, &key("s"), 5, 0, &mut rng, &mut fx).unwrap();
        let Reply::Array(items) = reply else { panic!("expected array") };
        let mut popped: Vec<Bytes> = items
            .into_iter()
            .map(|r| r.as_bulk().cloned().unwrap())
            .collect();
        popped.sort();
        assert_eq!(popped, members(&["a", "b", "c"]));

        // Key removed once drained.
        assert!(!store.exists(&key("s"), 0));

        // Journaled as the resolved SREM of the chosen members.
        let last = fx.journal.last().unwrap();
        assert_eq!(last.op, JournalOp::SRem);
        assert_eq!(last.args.len(), 3);
    }

    #[test]
    fn test_spop_partial_is_random_subset() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        let mut rng = rand::rng();
        sadd(
            &mut store,
            0,
            &key("s"),
            &members(&["a", "b", "c", "d", "e"]),
            0,
            &mut fx,
        )
        .unwrap();

        let reply = spop(&mut store, 0, &key("s"), 2, 0, &mut rng, &mut fx).unwrap();
        let Reply::Array(items) = reply else { panic!("expected array") };
        assert_eq!(items.len(), 2);
        assert_eq!(scard(&mut store, &key("s"), 0).unwrap(), Reply::Integer(3));
    }

    #[test]
    fn test_srem_and_empty_cleanup() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        sadd(&mut store, 0, &key("s"), &members(&["a"]), 0, &mut fx).unwrap();

        let reply = srem(&mut store, 0, &key("s"), &members(&["a", "zz"]), 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert!(!store.exists(&key("s"), 0));
    }

    #[test]
    fn test_sismember() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        sadd(&mut store, 0, &key("s"), &members(&["a"]), 0, &mut fx).unwrap();

        assert_eq!(sismember(&mut store, &key("s"), &key("a"), 0).unwrap(), Reply::Integer(1));
        assert_eq!(sismember(&mut store, &key("s"), &key("b"), 0).unwrap(), Reply::Integer(0));
        assert_eq!(sismember(&mut store, &key("zz"), &key("a"), 0).unwrap(), Reply::Integer(0));
    }
}
