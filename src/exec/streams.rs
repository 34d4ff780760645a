//! Stream operations (XADD, XLEN, XRANGE)
//!
//! Auto-generated ids are resolved before journaling, so replay appends the
//! exact same entries.

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, StreamId, TypeTag, Value};
use bytes::Bytes;

pub(super) fn xadd(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    id: Option<StreamId>,
    fields: &[(Bytes, Bytes)],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Stream, now_ms)?;
    if fields.is_empty() {
        return Err(CoreError::InvalidArgument("stream entry needs fields".into()));
    }

    let created = if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::empty_stream(), None, now_ms);
        true
    } else {
        false
    };

    let payload: usize = fields.iter().map(|(f, v)| f.len() + v.len()).sum();
    let stream = store
        .get_mut(key, now_ms)
        .and_then(Value::as_stream_mut)
        .unwrap();
    let id = id.unwrap_or_else(|| stream.next_id(now_ms));
    if !stream.add(id, fields.to_vec()) {
        if created {
            store.delete(key, now_ms);
        }
        return Err(CoreError::InvalidArgument(
            "stream id is not greater than the last id".into(),
        ));
    }
    store.note_write(key, (payload + std::mem::size_of::<StreamId>()) as isize);

    let mut args = Vec::with_capacity(2 + fields.len() * 2);
    args.push(JournalRecord::u64_arg(id.0));
    args.push(JournalRecord::u64_arg(id.1));
    for (field, value) in fields {
        args.push(field.clone());
        args.push(value.clone());
    }
    fx.record(JournalOp::XAdd, db, key.clone(), args);
    fx.event(key.clone(), OpKind::StreamAdd);
    Ok(Reply::bulk(format!("{}-{}", id.0, id.1)))
}

pub(super) fn xlen(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => value
            .as_stream()
            .map(|s| Reply::Integer(s.len() as i64))
            .ok_or(CoreError::TypeMismatch),
        None => Ok(Reply::Integer(0)),
    }
}

pub(super) fn xrange(
    store: &mut KeyspaceStore,
    key: &Bytes,
    start: StreamId,
    end: StreamId,
    count: Option<usize>,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    let entries = match store.get(key, now_ms) {
        Some(value) => value
            .as_stream()
            .ok_or(CoreError::TypeMismatch)?
            .range(start, end, count),
        None => return Ok(Reply::Array(Vec::new())),
    };

    let items = entries
        .into_iter()
        .map(|(id, fields)| {
            let mut flat = Vec::with_capacity(fields.len() * 2);
            for (field, value) in fields {
                flat.push(Reply::Bulk(field));
                flat.push(Reply::Bulk(value));
            }
            Reply::Array(vec![
                Reply::bulk(format!("{}-{}", id.0, id.1)),
                Reply::Array(flat),
            ])
        })
        .collect();
    Ok(Reply::Array(items))
}
