//! Core types used throughout the engine.

use serde::{Deserialize, Serialize};

/// Index of a logical database within a shard slice.
pub type DbIndex = u16;

/// Identifier of a shard (one worker thread, one slice).
pub type ShardId = u32;

/// Sentinel database index meaning "all databases".
pub const DB_ALL: DbIndex = DbIndex::MAX;

/// Kind of object stored under a key.
///
/// The discriminator a type-checked lookup compares against; the payload
/// itself lives in `PrimeValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjType {
    String = 0,
    List = 1,
    Set = 2,
    ZSet = 3,
    Hash = 4,
    Json = 5,
    Stream = 6,
}

impl ObjType {
    /// Number of distinct object types, for per-type accounting arrays.
    pub const COUNT: usize = 7;

    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::List => "list",
            ObjType::Set => "set",
            ObjType::ZSet => "zset",
            ObjType::Hash => "hash",
            ObjType::Json => "json",
            ObjType::Stream => "stream",
        }
    }
}

impl std::fmt::Display for ObjType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Context passed into every slice operation.
///
/// Carries the target database and the caller's notion of "now" so that
/// expiry decisions are stable for the duration of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbContext {
    pub db_index: DbIndex,
    pub time_now_ms: u64,
}

impl DbContext {
    pub fn new(db_index: DbIndex, time_now_ms: u64) -> Self {
        Self {
            db_index,
            time_now_ms,
        }
    }
}

impl Default for DbContext {
    fn default() -> Self {
        Self {
            db_index: 0,
            time_now_ms: 0,
        }
    }
}
