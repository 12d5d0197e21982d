//! Memory-pressure policies woven into the prime table's insert path.

use crate::cluster::slot::key_slot;
use crate::db::locks::LockTable;
use crate::db::table::{unlink_entry, TableOps};
use crate::journal::{Journal, JournalEntry};
use crate::table::{
    BumpPolicy, DashTable, Hotspot, InsertPolicy, PrimeKey, PrimeValue, SLOTS_PER_BUCKET,
    STASH_BUCKETS,
};
use crate::types::DbContext;
use bytes::Bytes;
use std::collections::HashSet;
use tracing::trace;

/// Headroom factor applied to the estimated cost of growing the table.
const GROWTH_HEADROOM: f64 = 1.1;

/// The capability set handed to the prime table on every insertion that may
/// grow it. Holds mutable views of the side tables so reclamation keeps the
/// whole database consistent while the prime table itself is borrowed by the
/// insert primitive.
pub struct PrimeEvictionPolicy<'a> {
    cntx: DbContext,
    can_evict: bool,
    mem_budget: i64,
    soft_limit: i64,
    apply_memory_limit: bool,
    bytes_per_object: i64,
    expire_base: u64,
    expire_allowed: bool,
    cluster_enabled: bool,

    ops: TableOps<'a>,
    locks: &'a LockTable,
    journal: Option<&'a Journal>,

    evicted: u32,
    checked: u32,
    reclaimed: u32,

    /// Keys removed during this insertion; the slice drains these for
    /// client-tracking invalidation after the insert returns.
    deleted_keys: Vec<Bytes>,
}

impl<'a> PrimeEvictionPolicy<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cntx: DbContext,
        can_evict: bool,
        mem_budget: i64,
        soft_limit: i64,
        apply_memory_limit: bool,
        bytes_per_object: i64,
        expire_base: u64,
        expire_allowed: bool,
        cluster_enabled: bool,
        ops: TableOps<'a>,
        locks: &'a LockTable,
        journal: Option<&'a Journal>,
    ) -> Self {
        Self {
            cntx,
            can_evict,
            mem_budget,
            soft_limit,
            apply_memory_limit,
            bytes_per_object,
            expire_base,
            expire_allowed,
            cluster_enabled,
            ops,
            locks,
            journal,
            evicted: 0,
            checked: 0,
            reclaimed: 0,
            deleted_keys: Vec::new(),
        }
    }

    pub fn mem_budget(&self) -> i64 {
        self.mem_budget
    }

    pub fn evicted(&self) -> u32 {
        self.evicted
    }

    pub fn checked(&self) -> u32 {
        self.checked
    }

    /// Entries reclaimed by garbage collection.
    pub fn reclaimed(&self) -> u32 {
        self.reclaimed
    }

    pub(crate) fn into_deleted_keys(self) -> Vec<Bytes> {
        self.deleted_keys
    }

    fn slot_of(&self, key: &[u8]) -> Option<u16> {
        self.cluster_enabled.then(|| key_slot(key))
    }

    fn remove(&mut self, table: &mut DashTable<PrimeValue>, pos: crate::table::Pos) {
        let (key, value) = unlink_entry(table, pos, &mut self.ops);
        self.mem_budget += (key.malloc_used() + value.malloc_used()) as i64;
        self.deleted_keys
            .push(Bytes::copy_from_slice(key.as_bytes()));
    }
}

impl InsertPolicy<PrimeValue> for PrimeEvictionPolicy<'_> {
    fn can_grow(&mut self, table: &DashTable<PrimeValue>) -> bool {
        if !self.apply_memory_limit || self.mem_budget > self.soft_limit {
            return true;
        }

        // Estimate the cost of the grown table at its current fill pattern,
        // not the bytes in use right now; growth that looks affordable today
        // fills up tomorrow.
        let new_available = (table.capacity() - table.len()) + crate::table::SLOTS_PER_BUCKET
            * crate::table::TOTAL_BUCKETS;
        let projected = DashTable::<PrimeValue>::seg_bytes() as f64
            + self.bytes_per_object as f64 * new_available as f64 * GROWTH_HEADROOM;
        let res = self.mem_budget > projected as i64;
        trace!(available = new_available, grow = res, "can_grow check");
        res
    }

    fn record_split(&mut self) {
        self.mem_budget -= DashTable::<PrimeValue>::seg_bytes() as i64;
    }

    fn garbage_collect(&mut self, hotspot: &Hotspot, table: &mut DashTable<PrimeValue>) -> u32 {
        let mut removed = 0;

        // Only the regular buckets colliding with the key; stash buckets are
        // filled last and rarely hold expired entries.
        for &bucket in hotspot.regular.iter() {
            for pos in table.bucket_positions(hotspot.segment, bucket) {
                let Some((key, value)) = table.pair_at(pos) else {
                    continue;
                };
                if !value.has_expire() {
                    continue;
                }
                self.checked += 1;

                let key_bytes = key.as_bytes();
                let deadline = self
                    .ops
                    .expire
                    .find(key_bytes)
                    .and_then(|p| self.ops.expire.value_at(p))
                    .map(|period| self.expire_base + period.duration_ms());
                let Some(deadline) = deadline else {
                    continue;
                };
                if self.cntx.time_now_ms < deadline || !self.expire_allowed {
                    continue;
                }

                if let Some(journal) = self.journal {
                    journal.record(JournalEntry::expired(
                        self.cntx.db_index,
                        self.slot_of(key_bytes),
                        key_bytes,
                    ));
                }
                self.remove(table, pos);
                removed += 1;
            }
        }
        self.reclaimed += removed;
        removed
    }

    fn evict(&mut self, hotspot: &Hotspot, table: &mut DashTable<PrimeValue>) -> u32 {
        if !self.can_evict {
            return 0;
        }

        // Deterministic stash pick, last slot first: stash tails hold the
        // coldest entries.
        let bucket = hotspot.stash[(hotspot.key_hash % STASH_BUCKETS as u64) as usize];
        let pos = crate::table::Pos {
            segment: hotspot.segment,
            bucket,
            slot: (SLOTS_PER_BUCKET - 1) as u8,
        };

        if let Some((key, _)) = table.pair_at(pos) {
            if key.is_sticky() {
                return 0;
            }
            let key_bytes = key.as_bytes().to_vec();
            if self.locks.is_locked(&key_bytes) {
                return 0;
            }

            if let Some(journal) = self.journal {
                journal.record(JournalEntry::expired(
                    self.cntx.db_index,
                    self.slot_of(&key_bytes),
                    &key_bytes,
                ));
            }
            self.remove(table, pos);
            self.evicted += 1;
        }
        table.shift_right(hotspot.segment, bucket);
        1
    }
}

/// Refuses to displace sticky keys or keys already bumped during the
/// current command.
pub struct PrimeBumpPolicy<'a> {
    bumped_items: &'a HashSet<Bytes>,
}

impl<'a> PrimeBumpPolicy<'a> {
    pub fn new(bumped_items: &'a HashSet<Bytes>) -> Self {
        Self { bumped_items }
    }
}

impl BumpPolicy for PrimeBumpPolicy<'_> {
    fn can_bump_down(&self, key: &PrimeKey) -> bool {
        !key.is_sticky() && !self.bumped_items.contains(key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_policy_refuses_sticky_and_bumped() {
        let mut bumped = HashSet::new();
        bumped.insert(Bytes::from("seen"));
        let policy = PrimeBumpPolicy::new(&bumped);

        let mut sticky = PrimeKey::new(b"pinned");
        sticky.set_sticky(true);
        assert!(!policy.can_bump_down(&sticky));
        assert!(!policy.can_bump_down(&PrimeKey::new(b"seen")));
        assert!(policy.can_bump_down(&PrimeKey::new(b"plain")));
    }
}
