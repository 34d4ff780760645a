//! Journal rewrite (compaction)
//!
//! A long-running journal is periodically replaced by the shortest record
//! sequence that rebuilds current state: one constructive record per live
//! key (plus a deadline record where needed). Each shard dumps its own
//! records inside its single-writer loop; the persistence worker writes
//! them to a temp file and atomically swaps the journal.

use super::record::{JournalOp, JournalRecord};
use crate::store::{Entry, KeyspaceStore, Value};
use bytes::Bytes;

/// Minimal record sequence reconstructing the live entries of one keyspace.
pub fn rewrite_records(db_index: u32, store: &KeyspaceStore, now_ms: u64) -> Vec<JournalRecord> {
    let mut records = Vec::new();

    for (key, entry) in store.iter() {
        if entry.is_expired(now_ms) {
            continue;
        }
        emit_entry(&mut records, db_index, key, entry);
    }
    records
}

fn emit_entry(records: &mut Vec<JournalRecord>, db: u32, key: &Bytes, entry: &Entry) {
    let deadline = entry.expire_at.unwrap_or(0);
    // Deadline rides inside Set/BitmapLoad/HllLoad records; collection
    // types get a separate ExpireAt record after reconstruction.
    let mut needs_expire_record = false;

    match &entry.value {
        Value::Str(value) => {
            records.push(JournalRecord::new(
                JournalOp::Set,
                db,
                key.clone(),
                vec![value.clone(), JournalRecord::u64_arg(deadline)],
            ));
        }
        Value::Bitmap(bits) => {
            records.push(JournalRecord::new(
                JournalOp::BitmapLoad,
                db,
                key.clone(),
                vec![
                    Bytes::copy_from_slice(bits),
                    JournalRecord::u64_arg(deadline),
                ],
            ));
        }
        Value::Hll(sketch) => {
            records.push(JournalRecord::new(
                JournalOp::HllLoad,
                db,
                key.clone(),
                vec![
                    Bytes::copy_from_slice(sketch.registers()),
                    JournalRecord::u64_arg(deadline),
                ],
            ));
        }
        Value::List(items) => {
            if items.is_empty() {
                return;
            }
            records.push(JournalRecord::new(
                JournalOp::RPush,
                db,
                key.clone(),
                items.iter().cloned().collect(),
            ));
            needs_expire_record = deadline != 0;
        }
        Value::Hash(map) => {
            if map.is_empty() {
                return;
            }
            let args = map
                .iter()
                .flat_map(|(f, v)| [f.clone(), v.clone()])
                .collect();
            records.push(JournalRecord::new(JournalOp::HSet, db, key.clone(), args));
            needs_expire_record = deadline != 0;
        }
        Value::Set(members) => {
            if members.is_empty() {
                return;
            }
            records.push(JournalRecord::new(
                JournalOp::SAdd,
                db,
                key.clone(),
                members.iter().cloned().collect(),
            ));
            needs_expire_record = deadline != 0;
        }
        Value::SortedSet(zset) => {
            if zset.is_empty() {
                return;
            }
            let args = zset
                .iter()
                .flat_map(|(member, score)| [JournalRecord::f64_arg(score), member.clone()])
                .collect();
            records.push(JournalRecord::new(JournalOp::ZAdd, db, key.clone(), args));
            needs_expire_record = deadline != 0;
        }
        Value::Stream(stream) => {
            if stream.is_empty() {
                return;
            }
            for (id, fields) in stream.iter() {
                let mut args = Vec::with_capacity(2 + fields.len() * 2);
                args.push(JournalRecord::u64_arg(id.0));
                args.push(JournalRecord::u64_arg(id.1));
                for (field, value) in fields {
                    args.push(field.clone());
                    args.push(value.clone());
                }
                records.push(JournalRecord::new(JournalOp::XAdd, db, key.clone(), args));
            }
            needs_expire_record = deadline != 0;
        }
    }

    if needs_expire_record {
        records.push(JournalRecord::new(
            JournalOp::ExpireAt,
            db,
            key.clone(),
            vec![JournalRecord::u64_arg(deadline)],
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::replay::replay_into;
    use crate::store::{HllSketch, StreamValue, ZSet};

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn dump(store: &KeyspaceStore) -> Vec<(Bytes, Value, Option<u64>)> {
        let mut out: Vec<(Bytes, Value, Option<u64>)> = store
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.expire_at))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn populated() -> KeyspaceStore {
        let mut store = KeyspaceStore::detached();
        store.set(key("s"), Value::str("v"), Some(u64::MAX / 2), 0);

        let mut list = std::collections::VecDeque::new();
        list.push_back(key("a"));
        list.push_back(key("b"));
        store.set(key("l"), Value::List(list), Some(u64::MAX / 2), 0);

        let mut hash = std::collections::HashMap::new();
        hash.insert(key("f"), key("v"));
        store.set(key("h"), Value::Hash(hash), None, 0);

        let mut members = std::collections::HashSet::new();
        members.insert(key("m"));
        store.set(key("set"), Value::Set(members), None, 0);

        let mut z = ZSet::new();
        z.insert(key("zm"), 2.5);
        store.set(key("z"), Value::SortedSet(z), None, 0);

        let mut stream = StreamValue::new();
        stream.add((3, 1), vec![(key("f"), key("v"))]);
        store.set(key("x"), Value::Stream(stream), None, 0);

        store.set(key("bits"), Value::Bitmap(vec![0xF0]), None, 0);

        let mut sketch = HllSketch::new();
        sketch.insert(b"one");
        store.set(key("hll"), Value::Hll(sketch), None, 0);

        store
    }

    #[test]
    fn test_rewrite_then_replay_reproduces_state() {
        let original = populated();
        let records = rewrite_records(0, &original, 0);

        let mut rebuilt = vec![KeyspaceStore::detached()];
        let applied = replay_into(&mut rebuilt, &records);
        assert_eq!(applied, records.len() as u64);

        assert_eq!(dump(&original), dump(&rebuilt[0]));
    }

    #[test]
    fn test_expired_entries_are_dropped_by_rewrite() {
        let mut store = KeyspaceStore::detached();
        store.set(key("dead"), Value::str("x"), Some(10), 0);
        store.set(key("live"), Value::str("y"), None, 0);

        let records = rewrite_records(0, &store, 100);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key("live"));
    }

    #[test]
    fn test_collection_deadline_becomes_expireat_record() {
        let mut store = KeyspaceStore::detached();
        let mut members = std::collections::HashSet::new();
        members.insert(key("m"));
        store.set(key("set"), Value::Set(members), Some(5000), 0);

        let records = rewrite_records(0, &store, 0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, JournalOp::SAdd);
        assert_eq!(records[1].op, JournalOp::ExpireAt);
        assert_eq!(JournalRecord::parse_u64(&records[1].args[0]), Some(5000));
    }
}
