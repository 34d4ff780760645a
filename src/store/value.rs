//! Value types for the key-value store

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Stream entry identifier: `(milliseconds, sequence)`.
pub type StreamId = (u64, u64);

/// One field/value pair inside a stream entry.
pub type StreamField = (Bytes, Bytes);

/// Represents the different types of values that can be stored
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value (binary-safe)
    Str(Bytes),

    /// List of values (ordered)
    List(VecDeque<Bytes>),

    /// Hash map (field -> value)
    Hash(HashMap<Bytes, Bytes>),

    /// Set of unique values (unordered)
    Set(HashSet<Bytes>),

    /// Sorted set: member -> score. Ordered iteration is done on demand.
    SortedSet(ZSet),

    /// Append-only stream of field lists keyed by `(ms, seq)` ids
    Stream(StreamValue),

    /// Bit array, grown on demand
    Bitmap(Vec<u8>),

    /// HyperLogLog cardinality sketch (dense registers)
    Hll(HllSketch),
}

/// Discriminant of a [`Value`], used for type introspection and the
/// snapshot codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Str = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    SortedSet = 4,
    Stream = 5,
    Bitmap = 6,
    Hll = 7,
}

impl TypeTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TypeTag::Str),
            1 => Some(TypeTag::List),
            2 => Some(TypeTag::Hash),
            3 => Some(TypeTag::Set),
            4 => Some(TypeTag::SortedSet),
            5 => Some(TypeTag::Stream),
            6 => Some(TypeTag::Bitmap),
            7 => Some(TypeTag::Hll),
            _ => None,
        }
    }

    /// Type name as reported to clients
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Str => "string",
            TypeTag::List => "list",
            TypeTag::Hash => "hash",
            TypeTag::Set => "set",
            TypeTag::SortedSet => "zset",
            TypeTag::Stream => "stream",
            TypeTag::Bitmap => "bitmap",
            TypeTag::Hll => "hyperloglog",
        }
    }
}

impl Value {
    /// Create a string value
    pub fn str(bytes: impl Into<Bytes>) -> Self {
        Value::Str(bytes.into())
    }

    /// Create an empty list
    pub fn empty_list() -> Self {
        Value::List(VecDeque::new())
    }

    /// Create an empty set
    pub fn empty_set() -> Self {
        Value::Set(HashSet::new())
    }

    /// Create an empty hash
    pub fn empty_hash() -> Self {
        Value::Hash(HashMap::new())
    }

    /// Create an empty sorted set
    pub fn empty_zset() -> Self {
        Value::SortedSet(ZSet::new())
    }

    /// Create an empty stream
    pub fn empty_stream() -> Self {
        Value::Stream(StreamValue::new())
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Hash(_) => TypeTag::Hash,
            Value::Set(_) => TypeTag::Set,
            Value::SortedSet(_) => TypeTag::SortedSet,
            Value::Stream(_) => TypeTag::Stream,
            Value::Bitmap(_) => TypeTag::Bitmap,
            Value::Hll(_) => TypeTag::Hll,
        }
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    pub fn as_str(&self) -> Option<&Bytes> {
        match self {
            Value::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&VecDeque<Bytes>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut VecDeque<Bytes>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&HashMap<Bytes, Bytes>> {
        match self {
            Value::Hash(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn as_hash_mut(&mut self) -> Option<&mut HashMap<Bytes, Bytes>> {
        match self {
            Value::Hash(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&HashSet<Bytes>> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut HashSet<Bytes>> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_zset(&self) -> Option<&ZSet> {
        match self {
            Value::SortedSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_zset_mut(&mut self) -> Option<&mut ZSet> {
        match self {
            Value::SortedSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamValue> {
        match self {
            Value::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut StreamValue> {
        match self {
            Value::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bitmap(&self) -> Option<&Vec<u8>> {
        match self {
            Value::Bitmap(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bitmap_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Value::Bitmap(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_hll(&self) -> Option<&HllSketch> {
        match self {
            Value::Hll(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_hll_mut(&mut self) -> Option<&mut HllSketch> {
        match self {
            Value::Hll(h) => Some(h),
            _ => None,
        }
    }

    /// Calculate approximate memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        match self {
            Value::Str(bytes) => bytes.len(),
            Value::List(list) => {
                let items: usize = list.iter().map(|b| b.len()).sum();
                items + std::mem::size_of::<VecDeque<Bytes>>()
            }
            Value::Hash(hash) => {
                let items: usize = hash.iter().map(|(k, v)| k.len() + v.len()).sum();
                items + std::mem::size_of::<HashMap<Bytes, Bytes>>()
            }
            Value::Set(set) => {
                let items: usize = set.iter().map(|b| b.len()).sum();
                items + std::mem::size_of::<HashSet<Bytes>>()
            }
            Value::SortedSet(z) => z.memory_usage(),
            Value::Stream(s) => s.memory_usage(),
            Value::Bitmap(b) => b.len(),
            Value::Hll(h) => h.memory_usage(),
        }
    }
}

/// Sorted set backed by a member -> score map.
///
/// Ranked views are produced on demand by sorting `(score, member)`; keeping
/// a second ordered structure in sync is not worth it at this scale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZSet {
    members: HashMap<Bytes, f64>,
}

impl ZSet {
    pub fn new() -> Self {
        ZSet::default()
    }

    /// Insert or update a member. Returns true if the member was new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        self.members.insert(member, score).is_none()
    }

    /// Remove a member. Returns true if it was present.
    pub fn remove(&mut self, member: &Bytes) -> bool {
        self.members.remove(member).is_some()
    }

    pub fn score(&self, member: &Bytes) -> Option<f64> {
        self.members.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.members.iter().map(|(m, s)| (m, *s))
    }

    /// Members ordered by `(score, member)` ascending.
    pub fn ranked(&self) -> Vec<(Bytes, f64)> {
        let mut out: Vec<(Bytes, f64)> =
            self.members.iter().map(|(m, s)| (m.clone(), *s)).collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }

    pub fn memory_usage(&self) -> usize {
        let items: usize = self
            .members
            .keys()
            .map(|m| m.len() + std::mem::size_of::<f64>())
            .sum();
        items + std::mem::size_of::<HashMap<Bytes, f64>>()
    }
}

/// Append-only stream value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamValue {
    entries: BTreeMap<StreamId, Vec<StreamField>>,
    /// Highest id ever added, kept across deletions so ids never regress.
    last_id: StreamId,
}

impl StreamValue {
    pub fn new() -> Self {
        StreamValue::default()
    }

    /// Next auto-generated id at wall-clock `now_ms`.
    pub fn next_id(&self, now_ms: u64) -> StreamId {
        if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        }
    }

    /// Append an entry. The id must be strictly greater than the last one
    /// and may not be the reserved floor id `(0, 0)`.
    pub fn add(&mut self, id: StreamId, fields: Vec<StreamField>) -> bool {
        if id <= self.last_id || id == (0, 0) {
            return false;
        }
        self.entries.insert(id, fields);
        self.last_id = id;
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    /// Entries with `start <= id <= end`, capped at `count` when given.
    pub fn range(
        &self,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Vec<(StreamId, Vec<StreamField>)> {
        if start > end {
            return Vec::new();
        }
        let iter = self
            .entries
            .range(start..=end)
            .map(|(id, fields)| (*id, fields.clone()));
        match count {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &Vec<StreamField>)> {
        self.entries.iter()
    }

    /// Rebuild from decoded parts (snapshot load).
    pub fn from_parts(entries: Vec<(StreamId, Vec<StreamField>)>, last_id: StreamId) -> Self {
        StreamValue {
            entries: entries.into_iter().collect(),
            last_id,
        }
    }

    pub fn memory_usage(&self) -> usize {
        let items: usize = self
            .entries
            .values()
            .flat_map(|fields| fields.iter())
            .map(|(f, v)| f.len() + v.len())
            .sum();
        items
            + self.entries.len() * std::mem::size_of::<StreamId>()
            + std::mem::size_of::<BTreeMap<StreamId, Vec<StreamField>>>()
    }
}

const HLL_P: u32 = 14;
const HLL_REGISTERS: usize = 1 << HLL_P;

/// Dense HyperLogLog sketch with 2^14 registers (~0.81% standard error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HllSketch {
    registers: Vec<u8>,
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl HllSketch {
    pub fn new() -> Self {
        HllSketch {
            registers: vec![0u8; HLL_REGISTERS],
        }
    }

    /// Rebuild from raw registers (snapshot load). Rejects wrong sizes.
    pub fn from_registers(registers: Vec<u8>) -> Option<Self> {
        if registers.len() != HLL_REGISTERS {
            return None;
        }
        Some(HllSketch { registers })
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    /// Add one element. Returns true if any register changed.
    pub fn insert(&mut self, element: &[u8]) -> bool {
        let hash = fnv1a_64(element);
        let index = (hash >> (64 - HLL_P)) as usize;
        let w = hash << HLL_P;
        let rho = if w == 0 {
            (64 - HLL_P + 1) as u8
        } else {
            (w.leading_zeros() + 1) as u8
        };
        if rho > self.registers[index] {
            self.registers[index] = rho;
            true
        } else {
            false
        }
    }

    /// Merge another sketch in (register-wise max). Returns true on change.
    pub fn merge(&mut self, other: &HllSketch) -> bool {
        let mut changed = false;
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
                changed = true;
            }
        }
        changed
    }

    /// Cardinality estimate with small-range linear-counting correction.
    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha_m = 0.7213 / (1.0 + 1.079 / m);

        let mut sum = 0.0_f64;
        let mut zeros = 0_u32;
        for &reg in &self.registers {
            sum += 2.0_f64.powi(-i32::from(reg));
            if reg == 0 {
                zeros += 1;
            }
        }

        let estimate = alpha_m * m * m / sum;
        if estimate <= 2.5 * m && zeros > 0 {
            (m * (m / f64::from(zeros)).ln()).round() as u64
        } else {
            estimate.round() as u64
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.registers.len()
    }
}

/// FNV-1a 64-bit hash for HyperLogLog element hashing.
fn fnv1a_64(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        h ^= u64::from(byte);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Value::str("x").type_name(), "string");
        assert_eq!(Value::empty_zset().type_name(), "zset");
        assert_eq!(Value::Bitmap(Vec::new()).type_name(), "bitmap");
    }

    #[test]
    fn test_type_tag_round_trip() {
        for raw in 0u8..8 {
            let tag = TypeTag::from_u8(raw).unwrap();
            assert_eq!(tag as u8, raw);
        }
        assert!(TypeTag::from_u8(8).is_none());
    }

    #[test]
    fn test_zset_ranked_orders_by_score_then_member() {
        let mut z = ZSet::new();
        z.insert(Bytes::from("b"), 2.0);
        z.insert(Bytes::from("a"), 2.0);
        z.insert(Bytes::from("c"), 1.0);

        let ranked = z.ranked();
        assert_eq!(ranked[0].0, Bytes::from("c"));
        assert_eq!(ranked[1].0, Bytes::from("a"));
        assert_eq!(ranked[2].0, Bytes::from("b"));
    }

    #[test]
    fn test_stream_ids_never_regress() {
        let mut s = StreamValue::new();
        assert!(s.add((5, 0), vec![(Bytes::from("f"), Bytes::from("v"))]));
        assert!(!s.add((5, 0), vec![]));
        assert!(!s.add((4, 9), vec![]));
        assert_eq!(s.next_id(5), (5, 1));
        assert_eq!(s.next_id(9), (9, 0));
    }

    #[test]
    fn test_stream_range_inclusive() {
        let mut s = StreamValue::new();
        for i in 1..=5u64 {
            s.add((i, 0), vec![(Bytes::from("n"), Bytes::from(i.to_string()))]);
        }
        let out = s.range((2, 0), (4, 0), None);
        assert_eq!(out.len(), 3);
        let capped = s.range((0, 1), (u64::MAX, 0), Some(2));
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_hll_estimate_accuracy() {
        let mut h = HllSketch::new();
        for i in 0..10_000u32 {
            h.insert(format!("element-{i}").as_bytes());
        }
        let estimate = h.estimate() as f64;
        // 2^14 registers give ~0.81% standard error; allow 5%.
        assert!((estimate - 10_000.0).abs() / 10_000.0 < 0.05);
    }

    #[test]
    fn test_hll_merge_is_union() {
        let mut a = HllSketch::new();
        let mut b = HllSketch::new();
        for i in 0..500u32 {
            a.insert(format!("a-{i}").as_bytes());
            b.insert(format!("b-{i}").as_bytes());
        }
        assert!(a.merge(&b));
        let estimate = a.estimate() as f64;
        assert!((estimate - 1000.0).abs() / 1000.0 < 0.1);
    }

    #[test]
    fn test_hll_insert_idempotent() {
        let mut h = HllSketch::new();
        assert!(h.insert(b"x"));
        assert!(!h.insert(b"x"));
    }
}
