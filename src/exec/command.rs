//! Parsed operations
//!
//! The wire protocol lives outside the core; what arrives here is already a
//! typed operation. The closed enum forces the dispatcher into one
//! exhaustive match, so a type-incompatible operation is rejected at the
//! boundary instead of deep inside a value implementation.

use crate::store::StreamId;
use bytes::Bytes;

/// Per-entry bookkeeping cost used when estimating the memory a write is
/// about to add (entry metadata, container headers, index slots). Must stay
/// an over-estimate of the accounted cost so that a write admitted after
/// eviction cannot land above the cap.
const ENTRY_OVERHEAD: usize = 256;

/// One parsed operation against a database.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // ── strings ─────────────────────────────────────────────────
    Set {
        key: Bytes,
        value: Bytes,
        /// Relative TTL; resolved to an absolute deadline at execution
        ttl_ms: Option<u64>,
    },
    Get {
        key: Bytes,
    },
    Append {
        key: Bytes,
        value: Bytes,
    },
    StrLen {
        key: Bytes,
    },
    Incr {
        key: Bytes,
    },
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    DecrBy {
        key: Bytes,
        delta: i64,
    },

    // ── keys ────────────────────────────────────────────────────
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    TypeOf {
        key: Bytes,
    },
    Expire {
        key: Bytes,
        ttl_ms: u64,
    },
    ExpireAt {
        key: Bytes,
        deadline_ms: u64,
    },
    Persist {
        key: Bytes,
    },
    Ttl {
        key: Bytes,
    },
    Scan {
        cursor: u64,
        count: usize,
        pattern: Option<Bytes>,
    },
    DbSize,
    FlushDb,

    // ── lists ───────────────────────────────────────────────────
    LPush {
        key: Bytes,
        values: Vec<Bytes>,
    },
    RPush {
        key: Bytes,
        values: Vec<Bytes>,
    },
    LPop {
        key: Bytes,
        count: Option<usize>,
    },
    RPop {
        key: Bytes,
        count: Option<usize>,
    },
    LRange {
        key: Bytes,
        start: i64,
        stop: i64,
    },
    LLen {
        key: Bytes,
    },
    /// Blocking head pop; `timeout_ms == 0` blocks without limit
    BLPop {
        key: Bytes,
        timeout_ms: u64,
    },

    // ── hashes ──────────────────────────────────────────────────
    HSet {
        key: Bytes,
        fields: Vec<(Bytes, Bytes)>,
    },
    HGet {
        key: Bytes,
        field: Bytes,
    },
    HDel {
        key: Bytes,
        fields: Vec<Bytes>,
    },
    HGetAll {
        key: Bytes,
    },
    HKeys {
        key: Bytes,
    },
    HLen {
        key: Bytes,
    },

    // ── sets ────────────────────────────────────────────────────
    SAdd {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SPop {
        key: Bytes,
        count: usize,
    },
    SMembers {
        key: Bytes,
    },
    SIsMember {
        key: Bytes,
        member: Bytes,
    },
    SCard {
        key: Bytes,
    },

    // ── sorted sets ─────────────────────────────────────────────
    ZAdd {
        key: Bytes,
        members: Vec<(f64, Bytes)>,
    },
    ZRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    ZScore {
        key: Bytes,
        member: Bytes,
    },
    ZCard {
        key: Bytes,
    },
    ZRange {
        key: Bytes,
        start: i64,
        stop: i64,
        with_scores: bool,
    },

    // ── streams ─────────────────────────────────────────────────
    XAdd {
        key: Bytes,
        /// Explicit id; `None` auto-generates from the wall clock
        id: Option<StreamId>,
        fields: Vec<(Bytes, Bytes)>,
    },
    XLen {
        key: Bytes,
    },
    XRange {
        key: Bytes,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    },

    // ── bitmaps ─────────────────────────────────────────────────
    SetBit {
        key: Bytes,
        offset: u64,
        bit: bool,
    },
    GetBit {
        key: Bytes,
        offset: u64,
    },
    BitCount {
        key: Bytes,
    },

    // ── hyperloglog ─────────────────────────────────────────────
    PfAdd {
        key: Bytes,
        elements: Vec<Bytes>,
    },
    PfCount {
        keys: Vec<Bytes>,
    },
    PfMerge {
        dest: Bytes,
        sources: Vec<Bytes>,
    },
}

impl Command {
    /// Command name, for logs and unknown-operation errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "SET",
            Command::Get { .. } => "GET",
            Command::Append { .. } => "APPEND",
            Command::StrLen { .. } => "STRLEN",
            Command::Incr { .. } => "INCR",
            Command::IncrBy { .. } => "INCRBY",
            Command::DecrBy { .. } => "DECRBY",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::TypeOf { .. } => "TYPE",
            Command::Expire { .. } => "EXPIRE",
            Command::ExpireAt { .. } => "EXPIREAT",
            Command::Persist { .. } => "PERSIST",
            Command::Ttl { .. } => "TTL",
            Command::Scan { .. } => "SCAN",
            Command::DbSize => "DBSIZE",
            Command::FlushDb => "FLUSHDB",
            Command::LPush { .. } => "LPUSH",
            Command::RPush { .. } => "RPUSH",
            Command::LPop { .. } => "LPOP",
            Command::RPop { .. } => "RPOP",
            Command::LRange { .. } => "LRANGE",
            Command::LLen { .. } => "LLEN",
            Command::BLPop { .. } => "BLPOP",
            Command::HSet { .. } => "HSET",
            Command::HGet { .. } => "HGET",
            Command::HDel { .. } => "HDEL",
            Command::HGetAll { .. } => "HGETALL",
            Command::HKeys { .. } => "HKEYS",
            Command::HLen { .. } => "HLEN",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SPop { .. } => "SPOP",
            Command::SMembers { .. } => "SMEMBERS",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::SCard { .. } => "SCARD",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZCard { .. } => "ZCARD",
            Command::ZRange { .. } => "ZRANGE",
            Command::XAdd { .. } => "XADD",
            Command::XLen { .. } => "XLEN",
            Command::XRange { .. } => "XRANGE",
            Command::SetBit { .. } => "SETBIT",
            Command::GetBit { .. } => "GETBIT",
            Command::BitCount { .. } => "BITCOUNT",
            Command::PfAdd { .. } => "PFADD",
            Command::PfCount { .. } => "PFCOUNT",
            Command::PfMerge { .. } => "PFMERGE",
        }
    }

    /// Whether this command can mutate the keyspace.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Append { .. }
                | Command::Incr { .. }
                | Command::IncrBy { .. }
                | Command::DecrBy { .. }
                | Command::Del { .. }
                | Command::Expire { .. }
                | Command::ExpireAt { .. }
                | Command::Persist { .. }
                | Command::FlushDb
                | Command::LPush { .. }
                | Command::RPush { .. }
                | Command::LPop { .. }
                | Command::RPop { .. }
                | Command::BLPop { .. }
                | Command::HSet { .. }
                | Command::HDel { .. }
                | Command::SAdd { .. }
                | Command::SRem { .. }
                | Command::SPop { .. }
                | Command::ZAdd { .. }
                | Command::ZRem { .. }
                | Command::XAdd { .. }
                | Command::SetBit { .. }
                | Command::PfAdd { .. }
                | Command::PfMerge { .. }
        )
    }

    /// Whether this command may suspend the caller waiting for data.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Command::BLPop { .. })
    }

    /// Worst-case estimate of the bytes this command is about to add,
    /// fed to the eviction check before the write is admitted. Zero for
    /// commands that cannot grow memory.
    pub fn estimated_growth(&self) -> usize {
        fn total(items: &[Bytes]) -> usize {
            items.iter().map(|b| b.len()).sum()
        }

        match self {
            Command::Set { key, value, .. } => key.len() + value.len() + ENTRY_OVERHEAD,
            Command::Append { key, value } => key.len() + value.len() + ENTRY_OVERHEAD,
            Command::Incr { key } | Command::IncrBy { key, .. } | Command::DecrBy { key, .. } => {
                key.len() + 24 + ENTRY_OVERHEAD
            }
            Command::LPush { key, values } | Command::RPush { key, values } => {
                key.len() + total(values) + ENTRY_OVERHEAD
            }
            Command::HSet { key, fields } => {
                let payload: usize = fields.iter().map(|(f, v)| f.len() + v.len()).sum();
                key.len() + payload + ENTRY_OVERHEAD
            }
            Command::SAdd { key, members } => key.len() + total(members) + ENTRY_OVERHEAD,
            Command::ZAdd { key, members } => {
                let payload: usize = members.iter().map(|(_, m)| m.len() + 8).sum();
                key.len() + payload + ENTRY_OVERHEAD
            }
            Command::XAdd { key, fields, .. } => {
                let payload: usize = fields.iter().map(|(f, v)| f.len() + v.len()).sum();
                key.len() + payload + 32 + ENTRY_OVERHEAD
            }
            // Worst case: the write extends the bit array up to the offset.
            Command::SetBit { key, offset, .. } => {
                key.len() + (*offset / 8) as usize + 1 + ENTRY_OVERHEAD
            }
            // Worst case: a fresh dense sketch.
            Command::PfAdd { key, .. } => key.len() + (1 << 14) + ENTRY_OVERHEAD,
            Command::PfMerge { dest, .. } => dest.len() + (1 << 14) + ENTRY_OVERHEAD,
            _ => 0,
        }
    }
}

/// What happened to a key, as reported through the mutation event hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Del,
    /// Removed by TTL expiry (lazy or active sweep)
    Expired,
    /// Removed under memory pressure
    Evicted,
    Expire,
    Persist,
    Append,
    Incr,
    ListPush,
    ListPop,
    HashSet,
    HashDel,
    SetAdd,
    SetRem,
    SetPop,
    ZSetAdd,
    ZSetRem,
    StreamAdd,
    BitSet,
    HllAdd,
    HllMerge,
    Flush,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Set => "set",
            OpKind::Del => "del",
            OpKind::Expired => "expired",
            OpKind::Evicted => "evicted",
            OpKind::Expire => "expire",
            OpKind::Persist => "persist",
            OpKind::Append => "append",
            OpKind::Incr => "incrby",
            OpKind::ListPush => "lpush",
            OpKind::ListPop => "lpop",
            OpKind::HashSet => "hset",
            OpKind::HashDel => "hdel",
            OpKind::SetAdd => "sadd",
            OpKind::SetRem => "srem",
            OpKind::SetPop => "spop",
            OpKind::ZSetAdd => "zadd",
            OpKind::ZSetRem => "zrem",
            OpKind::StreamAdd => "xadd",
            OpKind::BitSet => "setbit",
            OpKind::HllAdd => "pfadd",
            OpKind::HllMerge => "pfmerge",
            OpKind::Flush => "flushdb",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_classification() {
        assert!(Command::Set {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
            ttl_ms: None
        }
        .is_write());
        assert!(!Command::Get { key: Bytes::from("k") }.is_write());
        assert!(Command::BLPop { key: Bytes::from("k"), timeout_ms: 0 }.is_blocking());
    }

    #[test]
    fn test_growth_estimates() {
        let set = Command::Set {
            key: Bytes::from("key"),
            value: Bytes::from("0123456789"),
            ttl_ms: None,
        };
        assert!(set.estimated_growth() >= 13);

        let get = Command::Get { key: Bytes::from("key") };
        assert_eq!(get.estimated_growth(), 0);

        let setbit = Command::SetBit {
            key: Bytes::from("b"),
            offset: 8_000,
            bit: true,
        };
        assert!(setbit.estimated_growth() > 1000);
    }
}
