//! Bitmap operations (SETBIT, GETBIT, BITCOUNT)

use super::{expect_type, Effects, OpKind, Reply};
use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TypeTag, Value};
use bytes::Bytes;

/// Offsets are capped at 2^32 bits (a 512 MiB value), matching the usual
/// wire-protocol limit.
const MAX_BIT_OFFSET: u64 = 1 << 32;

pub(super) fn setbit(
    store: &mut KeyspaceStore,
    db: u32,
    key: &Bytes,
    offset: u64,
    bit: bool,
    now_ms: u64,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    expect_type(store, key, TypeTag::Bitmap, now_ms)?;
    if offset >= MAX_BIT_OFFSET {
        return Err(CoreError::InvalidArgument(
            "bit offset is out of range".into(),
        ));
    }

    if !store.exists(key, now_ms) {
        store.set(key.clone(), Value::Bitmap(Vec::new()), None, now_ms);
    }

    let byte_index = (offset / 8) as usize;
    let bit_index = 7 - (offset % 8) as u32;

    let (old_bit, grown) = {
        let bits = store
            .get_mut(key, now_ms)
            .and_then(Value::as_bitmap_mut)
            .unwrap();
        let grown = if byte_index >= bits.len() {
            let grow = byte_index + 1 - bits.len();
            bits.resize(byte_index + 1, 0);
            grow
        } else {
            0
        };
        let mask = 1u8 << bit_index;
        let old = bits[byte_index] & mask != 0;
        if bit {
            bits[byte_index] |= mask;
        } else {
            bits[byte_index] &= !mask;
        }
        (old, grown)
    };
    store.note_write(key, grown as isize);

    fx.record(
        JournalOp::SetBit,
        db,
        key.clone(),
        vec![
            JournalRecord::u64_arg(offset),
            Bytes::copy_from_slice(&[u8::from(bit)]),
        ],
    );
    fx.event(key.clone(), OpKind::BitSet);
    Ok(Reply::Integer(i64::from(old_bit)))
}

pub(super) fn getbit(
    store: &mut KeyspaceStore,
    key: &Bytes,
    offset: u64,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    if offset >= MAX_BIT_OFFSET {
        return Err(CoreError::InvalidArgument(
            "bit offset is out of range".into(),
        ));
    }
    match store.get(key, now_ms) {
        Some(value) => {
            let bits = value.as_bitmap().ok_or(CoreError::TypeMismatch)?;
            let byte_index = (offset / 8) as usize;
            let bit = bits
                .get(byte_index)
                .map(|byte| byte & (1u8 << (7 - (offset % 8) as u32)) != 0)
                .unwrap_or(false);
            Ok(Reply::Integer(i64::from(bit)))
        }
        None => Ok(Reply::Integer(0)),
    }
}

pub(super) fn bitcount(
    store: &mut KeyspaceStore,
    key: &Bytes,
    now_ms: u64,
) -> Result<Reply, CoreError> {
    match store.get(key, now_ms) {
        Some(value) => {
            let bits = value.as_bitmap().ok_or(CoreError::TypeMismatch)?;
            let ones: u32 = bits.iter().map(|byte| byte.count_ones()).sum();
            Ok(Reply::Integer(i64::from(ones)))
        }
        None => Ok(Reply::Integer(0)),
    }
}
