//! Per-database bundle of tables and accounting.

use crate::cluster::slot::{key_slot, SLOT_COUNT};
use crate::db::locks::LockTable;
use crate::db::top_keys::TopKeys;
use crate::table::{
    Cursor, ExpireTable, McFlagTable, Pos, PrimeKey, PrimeTable, PrimeValue, VersionClock,
};
use crate::types::{DbIndex, ObjType};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Per-slot usage counters, kept when cluster mode is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub key_count: u64,
    pub total_reads: u64,
    pub total_writes: u64,
    pub memory_bytes: u64,
}

impl std::ops::AddAssign for SlotStats {
    fn add_assign(&mut self, o: Self) {
        self.key_count += o.key_count;
        self.total_reads += o.total_reads;
        self.total_writes += o.total_writes;
        self.memory_bytes += o.memory_bytes;
    }
}

/// Aggregate statistics of one database.
#[derive(Debug, Clone, Default)]
pub struct DbTableStats {
    /// Number of keys stored inline, without a heap allocation.
    pub inline_keys: u64,

    /// Object memory usage besides hash-table capacity, for any non-inline
    /// object. Never negative.
    pub obj_memory_usage: i64,

    pub listpack_blob_cnt: u64,
    pub tiered_entries: u64,
    pub tiered_size: u64,

    pub memory_usage_by_type: [i64; ObjType::COUNT],
}

impl DbTableStats {
    pub fn add_type_memory_usage(&mut self, obj_type: ObjType, delta: i64) {
        debug_assert!(
            self.obj_memory_usage + delta >= 0,
            "can't decrease {delta} below {}",
            self.obj_memory_usage
        );
        self.memory_usage_by_type[obj_type.as_index()] += delta;
        self.obj_memory_usage += delta;
    }
}

impl std::ops::AddAssign<&DbTableStats> for DbTableStats {
    fn add_assign(&mut self, o: &DbTableStats) {
        self.inline_keys += o.inline_keys;
        self.obj_memory_usage += o.obj_memory_usage;
        self.listpack_blob_cnt += o.listpack_blob_cnt;
        self.tiered_entries += o.tiered_entries;
        self.tiered_size += o.tiered_size;
        for (a, b) in self
            .memory_usage_by_type
            .iter_mut()
            .zip(o.memory_usage_by_type.iter())
        {
            *a += b;
        }
    }
}

/// Dirty flag a transaction leaves on the keys it watches.
#[derive(Debug, Default)]
pub struct WatchMarker {
    dirty: AtomicBool,
}

impl WatchMarker {
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

/// A single database: the prime table plus all of its side structures.
pub struct DbTable {
    pub prime: PrimeTable,
    pub expire: ExpireTable,
    pub mcflag: McFlagTable,

    /// Transactional intent locks.
    pub trans_locks: LockTable,

    /// Watchers per key; markers are flipped dirty on mutation.
    pub watched_keys: HashMap<Bytes, Vec<Arc<WatchMarker>>>,

    pub stats: DbTableStats,

    /// Indexed by slot id; empty when cluster mode is off.
    pub slots_stats: Vec<SlotStats>,

    /// Resume point of the incremental expire sweep.
    pub expire_cursor: Cursor,

    pub top_keys: TopKeys,
    pub index: DbIndex,
}

impl DbTable {
    pub fn new(index: DbIndex, cluster_enabled: bool, clock: VersionClock) -> Self {
        Self {
            prime: PrimeTable::with_clock(clock),
            expire: ExpireTable::new(),
            mcflag: McFlagTable::new(),
            trans_locks: LockTable::new(),
            watched_keys: HashMap::new(),
            stats: DbTableStats::default(),
            slots_stats: if cluster_enabled {
                vec![SlotStats::default(); SLOT_COUNT]
            } else {
                Vec::new()
            },
            expire_cursor: Cursor::start(),
            top_keys: TopKeys::disabled(),
            index,
        }
    }

    pub fn cluster_enabled(&self) -> bool {
        !self.slots_stats.is_empty()
    }
}

/// Attribute `delta` bytes of `obj_type` memory to the database and, when
/// cluster mode is on, to the key's slot.
pub(crate) fn account_object_memory(
    key: &[u8],
    obj_type: ObjType,
    delta: i64,
    stats: &mut DbTableStats,
    slots_stats: &mut [SlotStats],
) {
    stats.add_type_memory_usage(obj_type, delta);
    if !slots_stats.is_empty() {
        let slot = &mut slots_stats[key_slot(key) as usize];
        slot.memory_bytes = (slot.memory_bytes as i64 + delta).max(0) as u64;
    }
}

/// Mutable views of everything a deletion must keep consistent, split out of
/// `DbTable` so the prime table can be borrowed separately during inserts.
pub(crate) struct TableOps<'a> {
    pub expire: &'a mut ExpireTable,
    pub mcflag: &'a mut McFlagTable,
    pub stats: &'a mut DbTableStats,
    pub slots_stats: &'a mut [SlotStats],
}

/// Remove the entry at `pos` from the prime table and every side structure,
/// returning it for journal/tiered handling by the caller.
pub(crate) fn unlink_entry(
    prime: &mut PrimeTable,
    pos: Pos,
    ops: &mut TableOps<'_>,
) -> (PrimeKey, PrimeValue) {
    let (key, value) = prime.erase(pos);
    let key_bytes = key.as_bytes();

    if value.has_expire() && ops.expire.erase_key(key_bytes).is_none() {
        error!(
            key = %String::from_utf8_lossy(key_bytes),
            "inconsistent state: expire entry missing on deletion"
        );
    }
    if value.has_mc_flag() && ops.mcflag.erase_key(key_bytes).is_none() {
        error!(
            key = %String::from_utf8_lossy(key_bytes),
            "inconsistent state: mcflag entry missing on deletion"
        );
    }

    ops.stats.inline_keys -= key.is_inline() as u64;
    let heap = (key.malloc_used() + value.malloc_used()) as i64;
    account_object_memory(key_bytes, value.obj_type(), -heap, ops.stats, ops.slots_stats);

    if value.is_packed() && matches!(value.obj_type(), ObjType::Hash | ObjType::ZSet) {
        ops.stats.listpack_blob_cnt -= 1;
    }
    if let Some((_, len)) = value.external_locator() {
        ops.stats.tiered_entries -= 1;
        ops.stats.tiered_size -= len as u64;
    }

    if !ops.slots_stats.is_empty() {
        ops.slots_stats[key_slot(key_bytes) as usize].key_count -= 1;
    }

    (key, value)
}
