//! HyperLogLog operations (PFADD, PFCOUNT, PFMERGE)

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::JournalOp;
use crate::store::{HllSketch, KeyspaceStore, TypeTag, Value};
use bytes::Bytes;

pub(super) fn pfadd(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    elements: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Hll, now_ms)?;

    let created = if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::Hll(HllSketch::new()), None, now_ms);
        true
    } else {
        false
    };

    let changed = {
        let sketch = store
            .get_mut(key, now_ms)
            .and_then(Value::as_hll_mut)
            .unwrap();
        let mut changed = false;
        for element in elements {
            changed |= sketch.insert(element);
        }
        changed
    };

    if changed || created {
        store.note_write(key, 0);
        fx.record(JournalOp::PfAdd, db, key.clone(), elements.to_vec());
        fx.event(key.clone(), OpKind::HllAdd);
    }
    Ok(Reply::Integer(i64::from(changed || created)))
}

pub(super) fn pfcount(
    store: &mut KeyspaceStore,
    keys: &[Bytes],
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match keys {
        [] => Ok(Reply::Integer(0)),
        [single] => match store.get(single, now_ms) {
            Some(value) => {
                let sketch = value.as_hll().ok_or(CoreError::TypeMismatch)?;
                Ok(Reply::Integer(sketch.estimate() as i64))
            }
            None => Ok(Reply::Integer(0)),
        },
        many => {
            let mut merged = HllSketch::new();
            for key in many {
                if let Some(value) = store.get(key, now_ms) {
                    merged.merge(value.as_hll().ok_or(CoreError::TypeMismatch)?);
                }
            }
            Ok(Reply::Integer(merged.estimate() as i64))
        }
    }
}

pub(super) fn pfmerge(
    store: &mut KeyspaceStore,
    db: u32,
    dest: &Bytes,
    sources: &[Bytes],
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, dest, TypeTag::Hll, now_ms)?;

    // Collect source sketches first so a type error aborts before the
    // destination is created or touched.
    let mut gathered: Vec<HllSketch> = Vec::with_capacity(sources.len());
    for key in sources {
        if let Some(value) = store.get(key, now_ms) {
            gathered.push(value.as_hll().ok_or(CoreError::TypeMismatch)?.clone());
        }
    }

    if !store.exists(dest, now_ms) {
        store.set(dest.clone(), Value::Hll(HllSketch::new()), None, now_ms);
    }
    {
        let sketch = store
            .get_mut(dest, now_ms)
            .and_then(Value::as_hll_mut)
            .unwrap();
        for source in &gathered {
            sketch.merge(source);
        }
    }
    store.note_write(dest, 0);

    fx.record(JournalOp::PfMerge, db, dest.clone(), sources.to_vec());
    fx.event(dest.clone(), OpKind::HllMerge);
    Ok(Reply::Ok)
}
