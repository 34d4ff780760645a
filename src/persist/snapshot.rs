//! Point-in-time snapshots
//!
//! A snapshot is a self-describing binary blob: magic, format version,
//! per-database sections, and a trailing xxh64 checksum over everything
//! before it. A load either verifies fully or is rejected — there is no
//! partial application of a snapshot that fails its checksum.
//!
//! Each shard encodes its own section inside its single-writer loop, which
//! is the "brief enumeration lock": nothing can mutate that keyspace while
//! its section is produced, and other shards keep serving. The background
//! worker assembles the sections, writes a temp file, fsyncs and renames;
//! the previous snapshot is rotated to `<path>.bak` as the corruption
//! fallback.
//!
//! Deadlines are stored as absolute unix milliseconds, so a key with 10s
//! remaining before save has at most 10s remaining after a reload, however
//! long the restart took. Entries already expired at encode time are
//! skipped.

use crate::error::CoreError;
use crate::store::{Entry, HllSketch, KeyspaceStore, StreamValue, TypeTag, Value, ZSet};
use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAGIC: &[u8; 8] = b"FORGEDB1";
const FORMAT_VERSION: u32 = 1;

/// Decoded per-database snapshot section.
#[derive(Debug)]
pub struct SnapshotSection {
    pub db_index: u32,
    pub entries: Vec<SnapshotEntry>,
}

/// One decoded entry.
#[derive(Debug)]
pub struct SnapshotEntry {
    pub key: Bytes,
    pub value: Value,
    pub expire_at: Option<u64>,
}

/// Path of the rotated previous snapshot.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

// ── Encoding ────────────────────────────────────────────────────

/// Encode one keyspace as a snapshot section.
pub fn encode_section(db_index: u32, store: &KeyspaceStore, now_ms: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&db_index.to_le_bytes());

    let live: Vec<(&Bytes, &Entry)> = store
        .iter()
        .filter(|(_, entry)| !entry.is_expired(now_ms))
        .collect();
    buf.extend_from_slice(&(live.len() as u64).to_le_bytes());

    for (key, entry) in live {
        put_bytes(&mut buf, key);
        buf.push(entry.value.type_tag() as u8);
        buf.extend_from_slice(&entry.expire_at.unwrap_or(0).to_le_bytes());
        encode_value(&mut buf, &entry.value);
    }
    buf
}

/// Concatenate sections into a complete, checksummed snapshot blob.
pub fn assemble(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    blob.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    for section in sections {
        blob.extend_from_slice(section);
    }
    let checksum = xxhash_rust::xxh64::xxh64(&blob, 0);
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Str(b) => put_bytes(buf, b),
        Value::List(list) => {
            buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for item in list {
                put_bytes(buf, item);
            }
        }
        Value::Hash(hash) => {
            buf.extend_from_slice(&(hash.len() as u32).to_le_bytes());
            for (field, val) in hash {
                put_bytes(buf, field);
                put_bytes(buf, val);
            }
        }
        Value::Set(set) => {
            buf.extend_from_slice(&(set.len() as u32).to_le_bytes());
            for member in set {
                put_bytes(buf, member);
            }
        }
        Value::SortedSet(z) => {
            buf.extend_from_slice(&(z.len() as u32).to_le_bytes());
            for (member, score) in z.iter() {
                buf.extend_from_slice(&score.to_le_bytes());
                put_bytes(buf, member);
            }
        }
        Value::Stream(s) => {
            let last = s.last_id();
            buf.extend_from_slice(&last.0.to_le_bytes());
            buf.extend_from_slice(&last.1.to_le_bytes());
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            for (id, fields) in s.iter() {
                buf.extend_from_slice(&id.0.to_le_bytes());
                buf.extend_from_slice(&id.1.to_le_bytes());
                buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
                for (field, val) in fields {
                    put_bytes(buf, field);
                    put_bytes(buf, val);
                }
            }
        }
        Value::Bitmap(bits) => {
            buf.extend_from_slice(&(bits.len() as u32).to_le_bytes());
            buf.extend_from_slice(bits);
        }
        Value::Hll(h) => {
            let registers = h.registers();
            buf.extend_from_slice(&(registers.len() as u32).to_le_bytes());
            buf.extend_from_slice(registers);
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

// ── File handling ───────────────────────────────────────────────

/// Write a snapshot blob durably: temp file, fsync, rotate the previous
/// snapshot to `.bak`, rename into place.
pub fn write_snapshot(path: &Path, blob: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(blob)?;
        file.sync_all()?;
    }

    if path.exists() {
        std::fs::rename(path, backup_path(path))?;
    }
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), bytes = blob.len(), "snapshot written");
    Ok(())
}

/// Load and verify a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<Vec<SnapshotSection>, CoreError> {
    let data = std::fs::read(path)?;
    decode(&data)
}

/// Load the snapshot at `path`, falling back to the `.bak` rotation if the
/// primary is corrupt. `Ok(None)` means no snapshot exists; a corruption
/// error with no valid fallback is returned as-is — the engine must not
/// start from an unverifiable state.
pub fn load_with_fallback(path: &Path) -> Result<Option<Vec<SnapshotSection>>, CoreError> {
    let backup = backup_path(path);

    if path.exists() {
        match load_snapshot(path) {
            Ok(sections) => return Ok(Some(sections)),
            Err(CoreError::Corruption(reason)) => {
                warn!(path = %path.display(), %reason, "snapshot rejected, trying fallback");
                if backup.exists() {
                    return load_snapshot(&backup).map(Some);
                }
                return Err(CoreError::Corruption(reason));
            }
            Err(other) => return Err(other),
        }
    }

    if backup.exists() {
        return load_snapshot(&backup).map(Some);
    }
    Ok(None)
}

// ── Decoding ────────────────────────────────────────────────────

fn decode(data: &[u8]) -> Result<Vec<SnapshotSection>, CoreError> {
    if data.len() < MAGIC.len() + 4 + 4 + 8 {
        return Err(CoreError::corrupt("snapshot too short"));
    }

    let (body, trailer) = data.split_at(data.len() - 8);
    let stored = u64::from_le_bytes(trailer.try_into().unwrap());
    let computed = xxhash_rust::xxh64::xxh64(body, 0);
    if stored != computed {
        return Err(CoreError::corrupt(format!(
            "snapshot checksum mismatch: expected {stored}, got {computed}"
        )));
    }

    let mut cur = Cursor::new(body);
    if cur.take(MAGIC.len())? != MAGIC.as_slice() {
        return Err(CoreError::corrupt("bad snapshot magic"));
    }
    let version = cur.u32()?;
    if version != FORMAT_VERSION {
        return Err(CoreError::corrupt(format!(
            "unsupported snapshot format version {version}"
        )));
    }

    let section_count = cur.u32()? as usize;
    let mut sections = Vec::with_capacity(section_count);
    for _ in 0..section_count {
        sections.push(decode_section(&mut cur)?);
    }
    if !cur.at_end() {
        return Err(CoreError::corrupt("trailing bytes after last section"));
    }
    Ok(sections)
}

fn decode_section(cur: &mut Cursor<'_>) -> Result<SnapshotSection, CoreError> {
    let db_index = cur.u32()?;
    let entry_count = cur.u64()? as usize;

    let mut entries = Vec::with_capacity(entry_count.min(1 << 20));
    for _ in 0..entry_count {
        let key = cur.bytes()?;
        let tag = TypeTag::from_u8(cur.u8()?)
            .ok_or_else(|| CoreError::corrupt("unknown value type tag"))?;
        let deadline = cur.u64()?;
        let value = decode_value(cur, tag)?;
        entries.push(SnapshotEntry {
            key,
            value,
            expire_at: if deadline == 0 { None } else { Some(deadline) },
        });
    }
    Ok(SnapshotSection { db_index, entries })
}

fn decode_value(cur: &mut Cursor<'_>, tag: TypeTag) -> Result<Value, CoreError> {
    match tag {
        TypeTag::Str => Ok(Value::Str(cur.bytes()?)),
        TypeTag::List => {
            let count = cur.u32()? as usize;
            let mut list = std::collections::VecDeque::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                list.push_back(cur.bytes()?);
            }
            Ok(Value::List(list))
        }
        TypeTag::Hash => {
            let count = cur.u32()? as usize;
            let mut hash = std::collections::HashMap::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let field = cur.bytes()?;
                let val = cur.bytes()?;
                hash.insert(field, val);
            }
            Ok(Value::Hash(hash))
        }
        TypeTag::Set => {
            let count = cur.u32()? as usize;
            let mut set = std::collections::HashSet::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                set.insert(cur.bytes()?);
            }
            Ok(Value::Set(set))
        }
        TypeTag::SortedSet => {
            let count = cur.u32()? as usize;
            let mut z = ZSet::new();
            for _ in 0..count {
                let score = f64::from_le_bytes(cur.take(8)?.try_into().unwrap());
                let member = cur.bytes()?;
                z.insert(member, score);
            }
            Ok(Value::SortedSet(z))
        }
        TypeTag::Stream => {
            let last_id = (cur.u64()?, cur.u64()?);
            let count = cur.u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let id = (cur.u64()?, cur.u64()?);
                let field_count = cur.u32()? as usize;
                let mut fields = Vec::with_capacity(field_count.min(1 << 16));
                for _ in 0..field_count {
                    let field = cur.bytes()?;
                    let val = cur.bytes()?;
                    fields.push((field, val));
                }
                entries.push((id, fields));
            }
            Ok(Value::Stream(StreamValue::from_parts(entries, last_id)))
        }
        TypeTag::Bitmap => {
            let len = cur.u32()? as usize;
            Ok(Value::Bitmap(cur.take(len)?.to_vec()))
        }
        TypeTag::Hll => {
            let len = cur.u32()? as usize;
            let registers = cur.take(len)?.to_vec();
            HllSketch::from_registers(registers)
                .map(Value::Hll)
                .ok_or_else(|| CoreError::corrupt("bad HyperLogLog register block"))
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.pos + n > self.data.len() {
            return Err(CoreError::corrupt("snapshot section truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Bytes, CoreError> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyspaceStore;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn populated_store() -> KeyspaceStore {
        let mut store = KeyspaceStore::detached();
        store.set(key("str"), Value::str("hello"), Some(90_000), 0);

        let mut list = std::collections::VecDeque::new();
        list.push_back(key("a"));
        list.push_back(key("b"));
        store.set(key("list"), Value::List(list), None, 0);

        let mut hash = std::collections::HashMap::new();
        hash.insert(key("f"), key("v"));
        store.set(key("hash"), Value::Hash(hash), None, 0);

        let mut set = std::collections::HashSet::new();
        set.insert(key("m"));
        store.set(key("set"), Value::Set(set), None, 0);

        let mut z = ZSet::new();
        z.insert(key("one"), 1.0);
        z.insert(key("two"), 2.0);
        store.set(key("zset"), Value::SortedSet(z), None, 0);

        let mut stream = StreamValue::new();
        stream.add((7, 0), vec![(key("field"), key("val"))]);
        store.set(key("stream"), Value::Stream(stream), None, 0);

        store.set(key("bits"), Value::Bitmap(vec![0b1010_0001, 0x00]), None, 0);

        let mut hll = HllSketch::new();
        hll.insert(b"x");
        hll.insert(b"y");
        store.set(key("hll"), Value::Hll(hll), None, 0);

        store
    }

    #[test]
    fn test_round_trip_all_types() {
        let store = populated_store();
        let blob = assemble(&[encode_section(2, &store, 10)]);
        let sections = decode(&blob).unwrap();

        assert_eq!(sections.len(), 1);
        let section = &sections[0];
        assert_eq!(section.db_index, 2);
        assert_eq!(section.entries.len(), 8);

        for entry in &section.entries {
            let original = store.peek(&entry.key).unwrap();
            assert_eq!(&entry.value, &original.value, "key {:?}", entry.key);
            assert_eq!(entry.expire_at, original.expire_at);
        }
    }

    #[test]
    fn test_expired_entries_are_skipped() {
        let mut store = KeyspaceStore::detached();
        store.set(key("live"), Value::str("x"), Some(5000), 0);
        store.set(key("dead"), Value::str("y"), Some(100), 0);

        let blob = assemble(&[encode_section(0, &store, 1000)]);
        let sections = decode(&blob).unwrap();
        assert_eq!(sections[0].entries.len(), 1);
        assert_eq!(sections[0].entries[0].key, key("live"));
    }

    #[test]
    fn test_checksum_rejects_flipped_byte() {
        let store = populated_store();
        let mut blob = assemble(&[encode_section(0, &store, 0)]);
        let mid = blob.len() / 2;
        blob[mid] ^= 0x01;

        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, CoreError::Corruption(_)));
    }

    #[test]
    fn test_write_rotates_backup_and_fallback_loads_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.snapshot");

        let mut store = KeyspaceStore::detached();
        store.set(key("first"), Value::str("1"), None, 0);
        write_snapshot(&path, &assemble(&[encode_section(0, &store, 0)])).unwrap();

        store.set(key("second"), Value::str("2"), None, 0);
        write_snapshot(&path, &assemble(&[encode_section(0, &store, 0)])).unwrap();
        assert!(backup_path(&path).exists());

        // Corrupt the primary; the fallback must serve the older state.
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let sections = load_with_fallback(&path).unwrap().unwrap();
        assert_eq!(sections[0].entries.len(), 1);
        assert_eq!(sections[0].entries[0].key, key("first"));
    }

    #[test]
    fn test_corrupt_primary_without_fallback_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.snapshot");
        std::fs::write(&path, b"FORGEDB1 not really a snapshot").unwrap();

        let err = load_with_fallback(&path).unwrap_err();
        assert!(matches!(err, CoreError::Corruption(_)));
    }

    #[test]
    fn test_missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.snapshot");
        assert!(load_with_fallback(&path).unwrap().is_none());
    }
}
