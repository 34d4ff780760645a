//! String operations (SET, GET, APPEND, STRLEN, INCR family)
//!
//! Counters are strings holding a decimal 64-bit integer; the increment
//! family journals the resolved value (with the surviving deadline) so
//! replay never re-derives arithmetic.

use super::{expect_type, parse_i64, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::{BufMut, Bytes, BytesMut};

pub(super) fn set(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    value: &Bytes,
    ttl_ms: Option<u64>,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    let deadline = ttl_ms.map(|ttl| now_ms.saturating_add(ttl));
    store.set(key.clone(), Value::Str(value.clone()), deadline, now_ms);
    fx.record(
        JournalOp::Set,
        db,
        key.clone(),
        vec![value.clone(), JournalRecord::u64_arg(deadline.unwrap_or(0))],
    );
    fx.event(key.clone(), OpKind::Set);
    Ok(Reply::Ok)
}

pub(super) fn get(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_str()
            .map(|b| Reply::Bulk(b.clone()))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Nil),
    }
}

pub(super) fn append(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    suffix: &Bytes,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Str, now_ms)?;

    let new_len = match store.get_mut(key, now_ms) {
        Some(value) => {
            let current = value.as_str().cloned().ok_or(CoreError::TypeMismatch)?;
            let mut joined = BytesMut::with_capacity(current.len() + suffix.len());
            joined.put_slice(&current);
            joined.put_slice(suffix);
            *value = Value::Str(joined.freeze());
            let len = current.len() + suffix.len();
            store.note_write(key, suffix.len() as isize);
            len
        }
        None => {
            store.set(key.clone(), Value::Str(suffix.clone()), None, now_ms);
            suffix.len()
        }
    };

    fx.record(JournalOp::Append, db, key.clone(), vec![suffix.clone()]);
    fx.event(key.clone(), OpKind::Append);
    Ok(Reply::Integer(new_len as i64))
}

pub(super) fn strlen(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_str()
            .map(|b| Reply::Integer(b.len() as i64))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Integer(0)),
    }
}

pub(super) fn incr_by(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    delta: i64,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Str, now_ms)?;

    let current = match store.get(key, now_ms) {
        Some(value) => parse_i64(value.as_str().ok_or(CoreError::TypeMismatch)?)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(CoreError::NotInteger)?;
    let repr = Bytes::from(next.to_string());

    // The deadline survives an increment.
    let deadline = store.peek(key).and_then(|entry| entry.expire_at);
    match store.get_mut(key, now_ms) {
        Some(value) => {
            let old_len = value.as_str().map(|b| b.len()).unwrap_or(0);
            *value = Value::Str(repr.clone());
            store.note_write(key, repr.len() as isize - old_len as isize);
        }
        None => store.set(key.clone(), Value::Str(repr.clone()), None, now_ms),
    }

    fx.record(
        JournalOp::Set,
        db,
        key.clone(),
        vec![repr, JournalRecord::u64_arg(deadline.unwrap_or(0))],
    );
    fx.event(key.clone(), OpKind::Incr);
    Ok(Reply::Integer(next))
}
