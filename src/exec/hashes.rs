//! Hash operations (HSET, HGET, HDEL, HGETALL, HKEYS, HLEN)

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::JournalOp;
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::Bytes;

pub(super) fn hset(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    fields: &[(Bytes, Bytes)],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Hash, now_ms)?;
    if fields.is_empty() {
        return Err(CoreError::InvalidArgument("no fields to set".into()));
    }

    if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::empty_hash(), None, now_ms);
    }

    let hash = store
        .get_mut(key, now_ms)
        .and_then(Value::as_hash_mut)
        .unwrap();
    let mut added = 0i64;
    let mut delta = 0isize;
    for (field, value) in fields {
        delta += value.len() as isize;
        match hash.insert(field.clone(), value.clone()) {
            Some(old) => delta -= old.len() as isize,
            None => {
                added += 1;
                delta += field.len() as isize;
            }
        }
    }
    store.note_write(key, delta);

    let args: Vec<Bytes> = fields
        .iter()
        .flat_map(|(f, v)| [f.clone(), v.clone()])
        .collect();
    fx.record(JournalOp::HSet, db, key.clone(), args);
    fx.event(key.clone(), OpKind::HashSet);
    Ok(Reply::Integer(added))
}

pub(super) fn hget(
    store: &mut KeyspaceStore,
    key: &Bytes,
    field: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let hash = value.as_hash().ok_or(CoreError::TypeMismatch)?;
            Ok(hash.get(field).map(|v| Reply::Bulk(v.clone())).unwrap_or(Reply::Nil))
        }
        None => Ok(Reply::Nil),
    }
}

pub(super) fn hdel(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    fields: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Hash, now_ms)?;

    let (removed, delta, emptied) = match store.get_mut(key, now_ms) {
        Some(value) => {
            let hash = value.as_hash_mut().ok_or(CoreError::TypeMismatch)?;
            let mut removed = 0i64;
            let mut delta = 0isize;
            for field in fields {
                if let Some(old) = hash.remove(field) {
                    removed += 1;
                    delta -= (field.len() + old.len()) as isize;
                }
            }
            (removed, delta, hash.is_empty())
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

    fx.record(JournalOp::HDel, db, key.clone(), fields.to_vec());
    fx.event(key.clone(), OpKind::HashDel);
    if emptied {
        fx.event(key.clone(), OpKind::Del);
    }
    Ok(Reply::Integer(removed))
}

pub(super) fn hgetall(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let hash = value.as_hash().ok_or(CoreError::TypeMismatch)?;
            let mut items = Vec::with_capacity(hash.len() * 2);
            for (field, val) in hash {
                items.push(Reply::Bulk(field.clone()));
                items.push(Reply::Bulk(val.clone()));
            }
            Ok(Reply::Array(items))
        }
        None => Ok(Reply::Array(Vec::new())),
    }
}

pub(super) fn hkeys(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let hash = value.as_hash().ok_or(CoreError::TypeMismatch)?;
            Ok(Reply::bulk_array(hash.keys().cloned().collect::<Vec<_>>()))
        }
        None => Ok(Reply::Array(Vec::new())),
    }
}

pub(super) fn hlen(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_hash()
            .map(|h| Reply::Integer(h.len() as i64))
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

    fn pair(f: &str, v: &str) -> (Bytes, Bytes) {
        (key(f), key(v))
    }

    #[test]
    fn test_hset_counts_new_fields_only() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();

        let reply = hset(
            &mut store,
            0,
            &key("h"),
            &[pair("a", "1"), pair("b", "2")],
            0,
            &mut fx,
        )
        .unwrap();
        assert_eq!(reply, Reply::Integer(2));

        // Overwriting an existing field adds nothing.
        let reply = hset(&mut store, 0, &key("h"), &[pair("a", "9")], 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(0));
        assert_eq!(
            hget(&mut store, &key("h"), &key("a"), 0).unwrap(),
            Reply::bulk("9")
        );
    }

    #[test]
    fn test_hdel_deletes_key_when_empty() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        hset(&mut store, 0, &key("h"), &[pair("a", "1")], 0, &mut fx).unwrap();

        let reply = hdel(&mut store, 0, &key("h"), &[key("a"), key("zz")], 0, &mut fx).unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert!(!store.exists(&key("h"), 0));
    }

    #[test]
    fn test_hgetall_pairs() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        hset(&mut store, 0, &key("h"), &[pair("a", "1"), pair("b", "2")], 0, &mut fx).unwrap();

        let reply = hgetall(&mut store, &key("h"), 0).unwrap();
        if let Reply::Array(items) = reply {
            assert_eq!(items.len(), 4);
        } else {
            panic!("expected array");
        }
        assert_eq!(hlen(&mut store, &key("h"), 0).unwrap(), Reply::Integer(2));
    }

    #[test]
    fn test_missing_key_replies() {
        let mut store = KeyspaceStore::detached();
        assert_eq!(hget(&mut store, &key("h"), &key("f"), 0).unwrap(), Reply::Nil);
        assert_eq!(hgetall(&mut store, &key("h"), 0).unwrap(), Reply::Array(Vec::new()));
        assert_eq!(hlen(&mut store, &key("h"), 0).unwrap(), Reply::Integer(0));
    }

    #[test]
    fn test_memory_delta_accounts_replacements() {
        let mut store = KeyspaceStore::detached();
        let mut fx = Effects::default();
        hset(&mut store, 0, &key("h"), &[pair("field", "short")], 0, &mut fx).unwrap();
        let before = store.used_bytes();

        hset(
            &mut store,
            0,
            &key("h"),
            &[pair("field", "a-much-longer-value")],
            0,
            &mut fx,
        )
        .unwrap();
        assert_eq!(
            store.used_bytes(),
            before + "a-much-longer-value".len() - "short".len()
        );
    }
}
