//! Compact interned key representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Keys up to this length are stored inline, without a heap allocation.
pub const INLINE_CAP: usize = 22;

const FLAG_STICKY: u8 = 1 << 0;

/// A compact byte-string key.
///
/// Short keys live inline inside the struct; longer keys spill to the heap.
/// Equality and hashing are byte-wise regardless of representation. The
/// sticky bit marks keys exempt from eviction.
#[derive(Clone)]
pub struct PrimeKey {
    repr: Repr,
    flags: u8,
}

#[derive(Clone)]
enum Repr {
    Inline { len: u8, buf: [u8; INLINE_CAP] },
    Heap(Box<[u8]>),
}

impl PrimeKey {
    pub fn new(key: &[u8]) -> Self {
        let repr = if key.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..key.len()].copy_from_slice(key);
            Repr::Inline {
                len: key.len() as u8,
                buf,
            }
        } else {
            Repr::Heap(key.into())
        };
        Self { repr, flags: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.repr {
            Repr::Inline { len, buf } => &buf[..*len as usize],
            Repr::Heap(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline { .. })
    }

    /// Heap bytes owned by this key; zero for inline keys.
    pub fn malloc_used(&self) -> usize {
        match &self.repr {
            Repr::Inline { .. } => 0,
            Repr::Heap(b) => b.len(),
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.flags & FLAG_STICKY != 0
    }

    pub fn set_sticky(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_STICKY;
        } else {
            self.flags &= !FLAG_STICKY;
        }
    }
}

impl PartialEq for PrimeKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PrimeKey {}

impl PartialEq<[u8]> for PrimeKey {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl Hash for PrimeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for PrimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrimeKey({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl From<&[u8]> for PrimeKey {
    fn from(key: &[u8]) -> Self {
        Self::new(key)
    }
}

impl From<&str> for PrimeKey {
    fn from(key: &str) -> Self {
        Self::new(key.as_bytes())
    }
}

impl Serialize for PrimeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for PrimeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(PrimeKey::new(&bytes))
    }
}
