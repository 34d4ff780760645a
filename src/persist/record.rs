//! Journal record format
//!
//! Binary format:
//! `[op(u8)] [db(u32)] [timestamp(u64)] [key_len(u32)] [key_bytes]
//!  [arg_count(u32)] ([arg_len(u32)] [arg_bytes])* [checksum(u64)]`
//!
//! Non-deterministic commands are journaled in resolved form (SPOP as the
//! SREM of the chosen members, INCR as the resulting value, XADD with an
//! explicit id, relative EXPIRE as an absolute deadline), so replaying an
//! identical record sequence always reconstructs identical state.

use crate::clock;
use bytes::Bytes;

/// Journal operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOp {
    /// Set a string value; args: value, deadline (8 bytes LE, 0 = none)
    Set = 1,
    /// Delete a key
    Del = 2,
    /// Set an absolute deadline; args: deadline (8 bytes LE)
    ExpireAt = 3,
    /// Clear the deadline
    Persist = 4,
    /// Set hash fields; args: field/value pairs
    HSet = 5,
    /// Delete hash fields; args: fields
    HDel = 6,
    /// Push values at the head; args: values
    LPush = 7,
    /// Push values at the tail; args: values
    RPush = 8,
    /// Pop from the head; args: count (8 bytes LE)
    LPop = 9,
    /// Pop from the tail; args: count (8 bytes LE)
    RPop = 10,
    /// Add set members; args: members
    SAdd = 11,
    /// Remove set members; args: members
    SRem = 12,
    /// Add sorted-set members; args: score (8 bytes LE f64 bits)/member pairs
    ZAdd = 13,
    /// Remove sorted-set members; args: members
    ZRem = 14,
    /// Append a stream entry; args: ms (8), seq (8), then field/value pairs
    XAdd = 15,
    /// Set one bit; args: offset (8 bytes LE), bit (1 byte)
    SetBit = 16,
    /// Add HyperLogLog elements; args: elements
    PfAdd = 17,
    /// Merge HyperLogLog keys into the record key; args: source keys
    PfMerge = 18,
    /// Append to a string value; args: suffix
    Append = 19,
    /// Remove every key of the database
    FlushDb = 20,
    /// Restore a raw bitmap (journal rewrite); args: bytes, deadline (8 LE)
    BitmapLoad = 21,
    /// Restore raw HLL registers (journal rewrite); args: registers, deadline
    HllLoad = 22,
}

impl JournalOp {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(JournalOp::Set),
            2 => Some(JournalOp::Del),
            3 => Some(JournalOp::ExpireAt),
            4 => Some(JournalOp::Persist),
            5 => Some(JournalOp::HSet),
            6 => Some(JournalOp::HDel),
            7 => Some(JournalOp::LPush),
            8 => Some(JournalOp::RPush),
            9 => Some(JournalOp::LPop),
            10 => Some(JournalOp::RPop),
            11 => Some(JournalOp::SAdd),
            12 => Some(JournalOp::SRem),
            13 => Some(JournalOp::ZAdd),
            14 => Some(JournalOp::ZRem),
            15 => Some(JournalOp::XAdd),
            16 => Some(JournalOp::SetBit),
            17 => Some(JournalOp::PfAdd),
            18 => Some(JournalOp::PfMerge),
            19 => Some(JournalOp::Append),
            20 => Some(JournalOp::FlushDb),
            21 => Some(JournalOp::BitmapLoad),
            22 => Some(JournalOp::HllLoad),
            _ => None,
        }
    }
}

/// Why a record failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The buffer ends before the record does (truncated tail).
    Truncated,
    /// The bytes are structurally invalid or fail the checksum.
    Corrupt(String),
}

/// One journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Operation type
    pub op: JournalOp,
    /// Target database index
    pub db_index: u32,
    /// Timestamp (milliseconds since UNIX epoch), informational
    pub timestamp: u64,
    /// Key (empty for FlushDb)
    pub key: Bytes,
    /// Operation arguments (meaning depends on the operation)
    pub args: Vec<Bytes>,
}

impl JournalRecord {
    /// Create a new record stamped with the current time
    pub fn new(op: JournalOp, db_index: u32, key: Bytes, args: Vec<Bytes>) -> Self {
        JournalRecord {
            op,
            db_index,
            timestamp: clock::now_ms(),
            key,
            args,
        }
    }

    /// Encode a u64 argument (deadlines, counts, offsets)
    pub fn u64_arg(value: u64) -> Bytes {
        Bytes::copy_from_slice(&value.to_le_bytes())
    }

    /// Encode an f64 argument (sorted-set scores)
    pub fn f64_arg(value: f64) -> Bytes {
        Bytes::copy_from_slice(&value.to_le_bytes())
    }

    /// Decode a u64 argument
    pub fn parse_u64(arg: &Bytes) -> Option<u64> {
        arg.as_ref().try_into().ok().map(u64::from_le_bytes)
    }

    /// Decode an f64 argument
    pub fn parse_f64(arg: &Bytes) -> Option<f64> {
        arg.as_ref().try_into().ok().map(f64::from_le_bytes)
    }

    /// Serialize to bytes with checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        // Operation type (1 byte)
        buf.push(self.op as u8);

        // Database index (4 bytes)
        buf.extend_from_slice(&self.db_index.to_le_bytes());

        // Timestamp (8 bytes)
        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        // Key length (4 bytes) + key bytes
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);

        // Argument count (4 bytes)
        buf.extend_from_slice(&(self.args.len() as u32).to_le_bytes());

        // Each argument: length (4 bytes) + bytes
        for arg in &self.args {
            buf.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            buf.extend_from_slice(arg);
        }

        // Checksum (8 bytes) - xxhash64 of all previous bytes
        let checksum = xxhash_rust::xxh64::xxh64(&buf, 0);
        buf.extend_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Deserialize from bytes with checksum verification.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), RecordError> {
        // Minimum: 1 (op) + 4 (db) + 8 (ts) + 4 (key_len) + 4 (arg_count) + 8 (checksum)
        if data.len() < 29 {
            return Err(RecordError::Truncated);
        }

        let mut pos = 0;

        // Operation type
        let op = JournalOp::from_u8(data[pos])
            .ok_or_else(|| RecordError::Corrupt(format!("invalid operation type {}", data[pos])))?;
        pos += 1;

        // Database index
        let db_index = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;

        // Timestamp
        let timestamp = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        pos += 8;

        // Key length and key
        let key_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;

        if pos + key_len > data.len() {
            return Err(RecordError::Truncated);
        }
        let key = Bytes::copy_from_slice(&data[pos..pos + key_len]);
        pos += key_len;

        // Argument count
        if pos + 4 > data.len() {
            return Err(RecordError::Truncated);
        }
        let arg_count = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;

        // Read arguments
        let mut args = Vec::with_capacity(arg_count.min(64));
        for _ in 0..arg_count {
            if pos + 4 > data.len() {
                return Err(RecordError::Truncated);
            }
            let arg_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;

            if pos + arg_len > data.len() {
                return Err(RecordError::Truncated);
            }
            args.push(Bytes::copy_from_slice(&data[pos..pos + arg_len]));
            pos += arg_len;
        }

        // Checksum verification
        if pos + 8 > data.len() {
            return Err(RecordError::Truncated);
        }
        let stored_checksum = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());

        let calculated_checksum = xxhash_rust::xxh64::xxh64(&data[..pos], 0);
        pos += 8;
        if stored_checksum != calculated_checksum {
            return Err(RecordError::Corrupt(format!(
                "checksum mismatch: expected {}, got {}",
                stored_checksum, calculated_checksum
            )));
        }

        Ok((
            JournalRecord {
                op,
                db_index,
                timestamp,
                key,
                args,
            },
            pos,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize_set() {
        let record = JournalRecord::new(
            JournalOp::Set,
            0,
            Bytes::from("mykey"),
            vec![Bytes::from("myvalue"), JournalRecord::u64_arg(0)],
        );

        let bytes = record.to_bytes();
        let (decoded, size) = JournalRecord::from_bytes(&bytes).unwrap();

        assert_eq!(size, bytes.len());
        assert_eq!(decoded.op, JournalOp::Set);
        assert_eq!(decoded.db_index, 0);
        assert_eq!(decoded.key, Bytes::from("mykey"));
        assert_eq!(decoded.args.len(), 2);
        assert_eq!(decoded.args[0], Bytes::from("myvalue"));
        assert_eq!(JournalRecord::parse_u64(&decoded.args[1]), Some(0));
    }

    #[test]
    fn test_serialize_deserialize_hset() {
        let record = JournalRecord::new(
            JournalOp::HSet,
            3,
            Bytes::from("myhash"),
            vec![Bytes::from("field1"), Bytes::from("value1")],
        );

        let bytes = record.to_bytes();
        let (decoded, _) = JournalRecord::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.op, JournalOp::HSet);
        assert_eq!(decoded.db_index, 3);
        assert_eq!(decoded.args[0], Bytes::from("field1"));
        assert_eq!(decoded.args[1], Bytes::from("value1"));
    }

    #[test]
    fn test_checksum_validation() {
        let record = JournalRecord::new(
            JournalOp::Set,
            0,
            Bytes::from("key"),
            vec![Bytes::from("value"), JournalRecord::u64_arg(0)],
        );

        let mut bytes = record.to_bytes();

        // Corrupt the checksum
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;

        let result = JournalRecord::from_bytes(&bytes);
        assert!(matches!(result, Err(RecordError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_record() {
        let record = JournalRecord::new(
            JournalOp::SAdd,
            1,
            Bytes::from("s"),
            vec![Bytes::from("a"), Bytes::from("b")],
        );
        let bytes = record.to_bytes();

        for cut in [5, bytes.len() / 2, bytes.len() - 1] {
            let result = JournalRecord::from_bytes(&bytes[..cut]);
            assert_eq!(result, Err(RecordError::Truncated), "cut at {cut}");
        }
    }

    #[test]
    fn test_float_args_round_trip() {
        let score = -12.75_f64;
        let arg = JournalRecord::f64_arg(score);
        assert_eq!(JournalRecord::parse_f64(&arg), Some(score));
    }
}
