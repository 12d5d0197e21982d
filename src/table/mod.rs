//! The segmented hash tables backing every database.
//!
//! `DashTable` is an open-addressed, extendible hash table organized as a
//! directory of fixed-capacity segments. Each segment holds a row of regular
//! buckets addressed by the key hash plus a small tail of stash buckets used
//! as overflow. The same structure, generic over the mapped value, backs the
//! prime table (key to object), the expire table (key to relative deadline)
//! and the memcached-flag table (key to u32).

mod dash;
mod expire;
mod key;
mod value;

pub use dash::{
    hash_key as dash_hash, BumpPolicy, Cursor, DashTable, Hotspot, InsertError, InsertPolicy,
    NoopInsertPolicy, Pos, VersionClock, REGULAR_BUCKETS, SLOTS_PER_BUCKET, STASH_BUCKETS,
    TOTAL_BUCKETS,
};
pub use expire::{ExpirePeriod, MAX_EXPIRE_DEADLINE_SEC};
pub use key::PrimeKey;
pub use value::{Encoding, PrimeValue, ScoredMember, StreamEntry};

/// Prime table: the authoritative key to value mapping of one database.
pub type PrimeTable = DashTable<PrimeValue>;

/// Expire table: parallel mapping of key to compressed relative deadline.
pub type ExpireTable = DashTable<ExpirePeriod>;

/// Memcached-flags table: parallel mapping of key to opaque u32 flags.
pub type McFlagTable = DashTable<u32>;
