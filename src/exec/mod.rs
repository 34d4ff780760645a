//! Command execution
//!
//! Every operation funnels through [`apply`]: one exhaustive match over the
//! closed [`Command`] enum, one implementation module per value family.
//! Execution produces a [`Reply`] plus side effects — journal records and
//! mutation events — that the shard loop flushes after the call. Keys
//! dropped by lazy expiry during the call are spliced in as journal deletes
//! *ahead* of the command's own records, preserving replay order.

mod command;
mod reply;
pub mod txn;

mod bitmaps;
mod hashes;
mod hll;
mod keys;
mod lists;
mod sets;
mod streams;
mod strings;
mod zsets;

pub use command::{Command, OpKind};
pub use reply::Reply;

pub(crate) use lists::blpop_try;

use crate::error::CoreError;
use crate::persist::{JournalOp, JournalRecord};
use crate::store::{KeyspaceStore, TypeTag};
use bytes::Bytes;
use rand::Rng;

/// Side effects of executed operations, flushed by the shard loop.
#[derive(Debug, Default)]
pub struct Effects {
    /// Journal records to append, in order
    pub journal: Vec<JournalRecord>,
    /// Mutated keys for the event hook, in order
    pub events: Vec<(Bytes, OpKind)>,
}

impl Effects {
    pub(crate) fn record(&mut self, op: JournalOp, db: u32, key: Bytes, args: Vec<Bytes>) {
        self.journal.push(JournalRecord::new(op, db, key, args));
    }

    pub(crate) fn event(&mut self, key: Bytes, kind: OpKind) {
        self.events.push((key, kind));
    }

    pub fn is_empty(&self) -> bool {
        self.journal.is_empty() && self.events.is_empty()
    }
}

/// Execute one command against a keyspace.
///
/// Mutating commands append their journal records and events to `fx` only
/// after the mutation succeeded. Lazy expirations triggered by the command
/// are propagated as deletes ordered before the command's own records.
pub fn apply<R: Rng>(
    store: &mut KeyspaceStore,
    db: u32,
    cmd: &Command,
    now_ms: u64,
    rng: &mut R,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    let journal_mark = fx.journal.len();
    let event_mark = fx.events.len();

    let result = dispatch(store, db, cmd, now_ms, rng, fx);

    let reaped = store.take_reaped();
    if !reaped.is_empty() {
        let records: Vec<JournalRecord> = reaped
            .iter()
            .map(|key| JournalRecord::new(JournalOp::Del, db, key.clone(), Vec::new()))
            .collect();
        fx.journal.splice(journal_mark..journal_mark, records);
        let events: Vec<(Bytes, OpKind)> = reaped
            .into_iter()
            .map(|key| (key, OpKind::Expired))
            .collect();
        fx.events.splice(event_mark..event_mark, events);
    }

    result
}

fn dispatch<R: Rng>(
    store: &mut KeyspaceStore,
    db: u32,
    cmd: &Command,
    now_ms: u64,
    rng: &mut R,
    fx: &mut Effects,
) -> Result<Reply, CoreError> {
    match cmd {
        // strings
        Command::Set { key, value, ttl_ms } => strings::set(store, db, key, value, *ttl_ms, now_ms, fx),
        Command::Get { key } => strings::get(store, key, now_ms),
        Command::Append { key, value } => strings::append(store, db, key, value, now_ms, fx),
        Command::StrLen { key } => strings::strlen(store, key, now_ms),
        Command::Incr { key } => strings::incr_by(store, db, key, 1, now_ms, fx),
        Command::IncrBy { key, delta } => strings::incr_by(store, db, key, *delta, now_ms, fx),
        Command::DecrBy { key, delta } => {
            strings::incr_by(store, db, key, delta.checked_neg().ok_or(CoreError::NotInteger)?, now_ms, fx)
        }

        // keys
        Command::Del { keys } => keys::del(store, db, keys, now_ms, fx),
        Command::Exists { keys } => keys::exists(store, keys, now_ms),
        Command::TypeOf { key } => keys::type_of(store, key, now_ms),
        Command::Expire { key, ttl_ms } => {
            keys::expire_at(store, db, key, now_ms.saturating_add(*ttl_ms), now_ms, fx)
        }
        Command::ExpireAt { key, deadline_ms } => {
            keys::expire_at(store, db, key, *deadline_ms, now_ms, fx)
        }
        Command::Persist { key } => keys::persist(store, db, key, now_ms, fx),
        Command::Ttl { key } => keys::ttl(store, key, now_ms),
        Command::Scan { cursor, count, pattern } => {
            keys::scan(store, *cursor, *count, pattern.as_ref(), now_ms)
        }
        Command::DbSize => Ok(Reply::Integer(store.len() as i64)),
        Command::FlushDb => keys::flush_db(store, db, fx),

        // lists
        Command::LPush { key, values } => lists::push(store, db, key, values, true, now_ms, fx),
        Command::RPush { key, values } => lists::push(store, db, key, values, false, now_ms, fx),
        Command::LPop { key, count } => lists::pop(store, db, key, true, *count, now_ms, fx),
        Command::RPop { key, count } => lists::pop(store, db, key, false, *count, now_ms, fx),
        Command::LRange { key, start, stop } => lists::range(store, key, *start, *stop, now_ms),
        Command::LLen { key } => lists::llen(store, key, now_ms),
        // Inside a commit (or replay) a blocking pop degrades to its
        // immediate form; the shard loop intercepts the live case.
        Command::BLPop { key, .. } => Ok(blpop_try(store, db, key, now_ms, fx)?.unwrap_or(Reply::Nil)),

        // hashes
        Command::HSet { key, fields } => hashes::hset(store, db, key, fields, now_ms, fx),
        Command::HGet { key, field } => hashes::hget(store, key, field, now_ms),
        Command::HDel { key, fields } => hashes::hdel(store, db, key, fields, now_ms, fx),
        Command::HGetAll { key } => hashes::hgetall(store, key, now_ms),
        Command::HKeys { key } => hashes::hkeys(store, key, now_ms),
        Command::HLen { key } => hashes::hlen(store, key, now_ms),

        // sets
        Command::SAdd { key, members } => sets::sadd(store, db, key, members, now_ms, fx),
        Command::SRem { key, members } => sets::srem(store, db, key, members, now_ms, fx),
        Command::SPop { key, count } => sets::spop(store, db, key, *count, now_ms, rng, fx),
        Command::SMembers { key } => sets::smembers(store, key, now_ms),
        Command::SIsMember { key, member } => sets::sismember(store, key, member, now_ms),
        Command::SCard { key } => sets::scard(store, key, now_ms),

        // sorted sets
        Command::ZAdd { key, members } => zsets::zadd(store, db, key, members, now_ms, fx),
        Command::ZRem { key, members } => zsets::zrem(store, db, key, members, now_ms, fx),
        Command::ZScore { key, member } => zsets::zscore(store, key, member, now_ms),
        Command::ZCard { key } => zsets::zcard(store, key, now_ms),
        Command::ZRange { key, start, stop, with_scores } => {
            zsets::zrange(store, key, *start, *stop, *with_scores, now_ms)
        }

        // streams
        Command::XAdd { key, id, fields } => streams::xadd(store, db, key, *id, fields, now_ms, fx),
        Command::XLen { key } => streams::xlen(store, key, now_ms),
        Command::XRange { key, start, end, count } => {
            streams::xrange(store, key, *start, *end, *count, now_ms)
        }

        // bitmaps
        Command::SetBit { key, offset, bit } => {
            bitmaps::setbit(store, db, key, *offset, *bit, now_ms, fx)
        }
        Command::GetBit { key, offset } => bitmaps::getbit(store, key, *offset, now_ms),
        Command::BitCount { key } => bitmaps::bitcount(store, key, now_ms),

        // hyperloglog
        Command::PfAdd { key, elements } => hll::pfadd(store, db, key, elements, now_ms, fx),
        Command::PfCount { keys } => hll::pfcount(store, keys, now_ms),
        Command::PfMerge { dest, sources } => hll::pfmerge(store, db, dest, sources, now_ms, fx),
    }
}

/// Pre-check a command's type constraints against the live keyspace without
/// executing it. Missing keys pass (the operation would create them).
/// Used at transaction queue time so a mismatch aborts before anything runs.
pub fn type_check(store: &mut KeyspaceStore, cmd: &Command, now_ms: u64) -> Result<(), CoreError> {
    match cmd {
        // SET overwrites any existing type.
        Command::Set { .. } => Ok(()),

        Command::Get { key }
        | Command::Append { key, .. }
        | Command::StrLen { key }
        | Command::Incr { key }
        | Command::IncrBy { key, .. }
        | Command::DecrBy { key, .. } => expect_type(store, key, TypeTag::Str, now_ms),

        Command::LPush { key, .. }
        | Command::RPush { key, .. }
        | Command::LPop { key, .. }
        | Command::RPop { key, .. }
        | Command::LRange { key, .. }
        | Command::LLen { key }
        | Command::BLPop { key, .. } => expect_type(store, key, TypeTag::List, now_ms),

        Command::HSet { key, .. }
        | Command::HGet { key, .. }
        | Command::HDel { key, .. }
        | Command::HGetAll { key }
        | Command::HKeys { key }
        | Command::HLen { key } => expect_type(store, key, TypeTag::Hash, now_ms),

        Command::SAdd { key, .. }
        | Command::SRem { key, .. }
        | Command::SPop { key, .. }
        | Command::SMembers { key }
        | Command::SIsMember { key, .. }
        | Command::SCard { key } => expect_type(store, key, TypeTag::Set, now_ms),

        Command::ZAdd { key, .. }
        | Command::ZRem { key, .. }
        | Command::ZScore { key, .. }
        | Command::ZCard { key }
        | Command::ZRange { key, .. } => expect_type(store, key, TypeTag::SortedSet, now_ms),

        Command::XAdd { key, .. } | Command::XLen { key } | Command::XRange { key, .. } => {
            expect_type(store, key, TypeTag::Stream, now_ms)
        }

        Command::SetBit { key, .. } | Command::GetBit { key, .. } | Command::BitCount { key } => {
            expect_type(store, key, TypeTag::Bitmap, now_ms)
        }

        Command::PfAdd { key, .. } => expect_type(store, key, TypeTag::Hll, now_ms),
        Command::PfCount { keys } => {
            for key in keys {
                expect_type(store, key, TypeTag::Hll, now_ms)?;
            }
            Ok(())
        }
        Command::PfMerge { dest, sources } => {
            expect_type(store, dest, TypeTag::Hll, now_ms)?;
            for key in sources {
                expect_type(store, key, TypeTag::Hll, now_ms)?;
            }
            Ok(())
        }

        Command::Del { .. }
        | Command::Exists { .. }
        | Command::TypeOf { .. }
        | Command::Expire { .. }
        | Command::ExpireAt { .. }
        | Command::Persist { .. }
        | Command::Ttl { .. }
        | Command::Scan { .. }
        | Command::DbSize
        | Command::FlushDb => Ok(()),
    }
}

/// Reject an operation when the key holds a different value type.
/// A missing key passes.
pub(crate) fn expect_type(
    store: &mut KeyspaceStore,
    key: &Bytes,
    tag: TypeTag,
    now_ms: u64,
) -> Result<(), CoreError> {
    match store.type_of(key, now_ms) {
        Some(actual) if actual != tag => Err(CoreError::TypeMismatch),
        _ => Ok(()),
    }
}

/// Parse an integer-in-string payload.
pub(crate) fn parse_i64(bytes: &Bytes) -> Result<i64, CoreError> {
    std::str::from_utf8(bytes)
        .map_err(|_| CoreError::NotInteger)?
        .parse::<i64>()
        .map_err(|_| CoreError::NotInteger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_apply_routes_and_journals() {
        let mut store = KeyspaceStore::detached();
        let mut rng = rand::rng();
        let mut fx = Effects::default();

        let cmd = Command::Set {
            key: key("k"),
            value: Bytes::from("v"),
            ttl_ms: None,
        };
        let reply = apply(&mut store, 0, &cmd, 0, &mut rng, &mut fx).unwrap();
        assert_eq!(reply, Reply::Ok);
        assert_eq!(fx.journal.len(), 1);
        assert_eq!(fx.journal[0].op, JournalOp::Set);
        assert_eq!(fx.events, vec![(key("k"), OpKind::Set)]);
    }

    #[test]
    fn test_reads_leave_no_effects() {
        let mut store = KeyspaceStore::detached();
        store.set(key("k"), Value::str("v"), None, 0);
        let mut rng = rand::rng();
        let mut fx = Effects::default();

        let reply = apply(&mut store, 0, &Command::Get { key: key("k") }, 0, &mut rng, &mut fx).unwrap();
        assert_eq!(reply, Reply::bulk("v"));
        assert!(fx.is_empty());
    }

    #[test]
    fn test_lazy_expiry_del_precedes_command_records() {
        let mut store = KeyspaceStore::detached();
        store.set(key("k"), Value::str("old"), Some(100), 0);
        let mut rng = rand::rng();
        let mut fx = Effects::default();

        // At t=200 the old entry is dead; SET drops it lazily then writes.
        let cmd = Command::Set {
            key: key("k"),
            value: Bytes::from("new"),
            ttl_ms: None,
        };
        apply(&mut store, 0, &cmd, 200, &mut rng, &mut fx).unwrap();

        assert_eq!(fx.journal.len(), 2);
        assert_eq!(fx.journal[0].op, JournalOp::Del);
        assert_eq!(fx.journal[1].op, JournalOp::Set);
        assert_eq!(fx.events[0], (key("k"), OpKind::Expired));
        assert_eq!(fx.events[1], (key("k"), OpKind::Set));
    }

    #[test]
    fn test_type_check_passes_missing_and_matching() {
        let mut store = KeyspaceStore::detached();
        store.set(key("s"), Value::str("v"), None, 0);

        assert!(type_check(&mut store, &Command::Get { key: key("s") }, 0).is_ok());
        assert!(type_check(&mut store, &Command::Get { key: key("missing") }, 0).is_ok());
        assert_eq!(
            type_check(&mut store, &Command::LPush { key: key("s"), values: vec![key("x")] }, 0),
            Err(CoreError::TypeMismatch)
        );
    }

    #[test]
    fn test_wrongtype_surfaces_from_dispatch() {
        let mut store = KeyspaceStore::detached();
        store.set(key("s"), Value::str("v"), None, 0);
        let mut rng = rand::rng();
        let mut fx = Effects::default();

        let err = apply(
            &mut store,
            0,
            &Command::SAdd { key: key("s"), members: vec![key("m")] },
            0,
            &mut rng,
            &mut fx,
        )
        .unwrap_err();
        assert_eq!(err, CoreError::TypeMismatch);
        assert!(fx.journal.is_empty());
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(&Bytes::from("42")).unwrap(), 42);
        assert_eq!(parse_i64(&Bytes::from("-7")).unwrap(), -7);
        assert!(parse_i64(&Bytes::from("4.2")).is_err());
        assert!(parse_i64(&Bytes::from("abc")).is_err());
    }
}
