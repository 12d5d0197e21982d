//! Tagged value representation for all supported object types.

use crate::types::ObjType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

const FLAG_EXPIRE: u8 = 1 << 0;
const FLAG_MCFLAG: u8 = 1 << 1;
const FLAG_IO_PENDING: u8 = 1 << 2;

/// Per-entry bookkeeping overhead assumed for collection members.
const ENTRY_OVERHEAD: usize = 16;

/// Collections up to this many members use the packed encoding.
const PACKED_THRESHOLD: usize = 128;

/// Internal encoding of a value, tracked for stats and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Raw,
    Int,
    ListPack,
    HashTable,
    SkipList,
    Stream,
    External,
}

/// One member of a sorted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub score: f64,
    pub member: Bytes,
}

/// One entry of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: (u64, u64),
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Payload {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    ZSet(Vec<ScoredMember>),
    Hash(HashMap<Bytes, Bytes>),
    // Carried as text on the wire: json documents are self-describing and
    // do not survive non-self-describing codecs otherwise.
    Json(#[serde(with = "json_text")] serde_json::Value),
    Stream(Vec<StreamEntry>),
    /// Body lives on the tiered store; only the locator is kept in memory.
    External {
        offset: u64,
        len: u32,
        obj_type: ObjType,
    },
}

/// The value side of a prime-table entry.
///
/// A tagged union over the supported object types plus tiered-storage state.
/// The has-expire and has-flag bits mirror the presence of entries in the
/// parallel expire and mcflag tables; the slice keeps them in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeValue {
    payload: Payload,
    encoding: Encoding,
    flags: u8,
}

impl Default for PrimeValue {
    fn default() -> Self {
        Self {
            payload: Payload::Str(Bytes::new()),
            encoding: Encoding::Raw,
            flags: 0,
        }
    }
}

impl PrimeValue {
    pub fn from_str(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let encoding = if !data.is_empty()
            && data.len() <= 20
            && std::str::from_utf8(&data).map_or(false, |s| s.parse::<i64>().is_ok())
        {
            Encoding::Int
        } else {
            Encoding::Raw
        };
        Self {
            payload: Payload::Str(data),
            encoding,
            flags: 0,
        }
    }

    pub fn from_list(items: impl IntoIterator<Item = Bytes>) -> Self {
        let items: VecDeque<Bytes> = items.into_iter().collect();
        let encoding = packed_or(&items.len(), Encoding::ListPack, Encoding::HashTable);
        Self {
            payload: Payload::List(items),
            encoding,
            flags: 0,
        }
    }

    pub fn from_set(items: impl IntoIterator<Item = Bytes>) -> Self {
        let items: HashSet<Bytes> = items.into_iter().collect();
        let encoding = packed_or(&items.len(), Encoding::ListPack, Encoding::HashTable);
        Self {
            payload: Payload::Set(items),
            encoding,
            flags: 0,
        }
    }

    pub fn from_zset(mut members: Vec<ScoredMember>) -> Self {
        members.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        let encoding = packed_or(&members.len(), Encoding::ListPack, Encoding::SkipList);
        Self {
            payload: Payload::ZSet(members),
            encoding,
            flags: 0,
        }
    }

    pub fn from_hash(fields: HashMap<Bytes, Bytes>) -> Self {
        let encoding = packed_or(&fields.len(), Encoding::ListPack, Encoding::HashTable);
        Self {
            payload: Payload::Hash(fields),
            encoding,
            flags: 0,
        }
    }

    pub fn from_json(doc: serde_json::Value) -> Self {
        Self {
            payload: Payload::Json(doc),
            encoding: Encoding::Raw,
            flags: 0,
        }
    }

    pub fn from_stream(entries: Vec<StreamEntry>) -> Self {
        Self {
            payload: Payload::Stream(entries),
            encoding: Encoding::Stream,
            flags: 0,
        }
    }

    /// Replace the in-memory body with a tiered-storage locator.
    pub fn from_external(offset: u64, len: u32, obj_type: ObjType) -> Self {
        Self {
            payload: Payload::External {
                offset,
                len,
                obj_type,
            },
            encoding: Encoding::External,
            flags: 0,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match &self.payload {
            Payload::Str(_) => ObjType::String,
            Payload::List(_) => ObjType::List,
            Payload::Set(_) => ObjType::Set,
            Payload::ZSet(_) => ObjType::ZSet,
            Payload::Hash(_) => ObjType::Hash,
            Payload::Json(_) => ObjType::Json,
            Payload::Stream(_) => ObjType::Stream,
            Payload::External { obj_type, .. } => *obj_type,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn is_external(&self) -> bool {
        matches!(self.payload, Payload::External { .. })
    }

    /// The tiered locator, if the body is external.
    pub fn external_locator(&self) -> Option<(u64, u32)> {
        match self.payload {
            Payload::External { offset, len, .. } => Some((offset, len)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn has_expire(&self) -> bool {
        self.flags & FLAG_EXPIRE != 0
    }

    pub fn set_expire(&mut self, on: bool) {
        self.set_flag(FLAG_EXPIRE, on);
    }

    pub fn has_mc_flag(&self) -> bool {
        self.flags & FLAG_MCFLAG != 0
    }

    pub fn set_mc_flag(&mut self, on: bool) {
        self.set_flag(FLAG_MCFLAG, on);
    }

    pub fn has_io_pending(&self) -> bool {
        self.flags & FLAG_IO_PENDING != 0
    }

    pub fn set_io_pending(&mut self, on: bool) {
        self.set_flag(FLAG_IO_PENDING, on);
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Approximate heap bytes owned by the value body.
    pub fn malloc_used(&self) -> usize {
        match &self.payload {
            Payload::Str(b) => b.len(),
            Payload::List(items) => items.iter().map(|b| b.len() + ENTRY_OVERHEAD).sum(),
            Payload::Set(items) => items.iter().map(|b| b.len() + ENTRY_OVERHEAD).sum(),
            Payload::ZSet(members) => members
                .iter()
                .map(|m| m.member.len() + 8 + ENTRY_OVERHEAD)
                .sum(),
            Payload::Hash(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD)
                .sum(),
            Payload::Json(doc) => json_size(doc),
            Payload::Stream(entries) => entries
                .iter()
                .map(|e| {
                    e.fields
                        .iter()
                        .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD)
                        .sum::<usize>()
                        + ENTRY_OVERHEAD
                })
                .sum(),
            Payload::External { .. } => 0,
        }
    }

    /// Whether the value uses one of the packed small-collection encodings.
    pub fn is_packed(&self) -> bool {
        self.encoding == Encoding::ListPack
    }
}

mod json_text {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        v.to_string().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

fn packed_or(len: &usize, small: Encoding, large: Encoding) -> Encoding {
    if *len <= PACKED_THRESHOLD {
        small
    } else {
        large
    }
}

fn json_size(doc: &serde_json::Value) -> usize {
    use serde_json::Value;
    match doc {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len() + ENTRY_OVERHEAD,
        Value::Array(items) => items.iter().map(json_size).sum::<usize>() + ENTRY_OVERHEAD,
        Value::Object(fields) => {
            fields
                .iter()
                .map(|(k, v)| k.len() + json_size(v))
                .sum::<usize>()
                + ENTRY_OVERHEAD
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty_string() {
        let v = PrimeValue::default();
        assert_eq!(v.obj_type(), ObjType::String);
        assert_eq!(v.malloc_used(), 0);
        assert!(!v.has_expire());
    }

    #[test]
    fn test_int_encoding_detection() {
        assert_eq!(PrimeValue::from_str("12345").encoding(), Encoding::Int);
        assert_eq!(PrimeValue::from_str("12a45").encoding(), Encoding::Raw);
        assert_eq!(PrimeValue::from_str("").encoding(), Encoding::Raw);
    }

    #[test]
    fn test_small_hash_is_packed() {
        let mut fields = HashMap::new();
        fields.insert(Bytes::from("f"), Bytes::from("v"));
        let v = PrimeValue::from_hash(fields);
        assert!(v.is_packed());
        assert_eq!(v.obj_type(), ObjType::Hash);

        let big: HashMap<Bytes, Bytes> = (0..PACKED_THRESHOLD + 1)
            .map(|i| (Bytes::from(format!("f{i}")), Bytes::from("v")))
            .collect();
        assert!(!PrimeValue::from_hash(big).is_packed());
    }

    #[test]
    fn test_external_keeps_type() {
        let v = PrimeValue::from_external(4096, 100, ObjType::String);
        assert!(v.is_external());
        assert_eq!(v.obj_type(), ObjType::String);
        assert_eq!(v.external_locator(), Some((4096, 100)));
        assert_eq!(v.malloc_used(), 0);
    }

    #[test]
    fn test_flags_independent() {
        let mut v = PrimeValue::from_str("x");
        v.set_expire(true);
        v.set_io_pending(true);
        assert!(v.has_expire());
        assert!(v.has_io_pending());
        assert!(!v.has_mc_flag());
        v.set_expire(false);
        assert!(!v.has_expire());
        assert!(v.has_io_pending());
    }

    #[test]
    fn test_zset_sorted_on_construction() {
        let v = PrimeValue::from_zset(vec![
            ScoredMember {
                score: 2.0,
                member: Bytes::from("b"),
            },
            ScoredMember {
                score: 1.0,
                member: Bytes::from("a"),
            },
        ]);
        if let Payload::ZSet(members) = &v.payload {
            assert_eq!(members[0].member, Bytes::from("a"));
        } else {
            panic!("expected zset payload");
        }
    }

    #[test]
    fn test_restore_roundtrip() {
        let v = PrimeValue::from_str("payload");
        let bytes = bincode::serialize(&v).unwrap();
        let back: PrimeValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_json_survives_binary_codec() {
        let v = PrimeValue::from_json(serde_json::json!({"a": [1, 2, {"b": null}]}));
        let bytes = bincode::serialize(&v).unwrap();
        let back: PrimeValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }
}
