//! The per-shard data slice: single-threaded owner of one shard's key space.
//!
//! All reads and writes of a shard go through its `DbSlice`. The slice
//! mediates the lookup/insert/update/delete protocol over the prime table,
//! runs lazy expiration and memory-pressure eviction, keeps the parallel
//! side tables consistent, and notifies registered observers before any
//! mutation they might care about.
//!
//! There is no lock on the slice. Correctness comes from the guarantee that
//! only the owning shard worker touches it, one operation at a time; code
//! that can suspend cooperatively re-derives table positions from keys
//! afterwards instead of trusting held positions.

use crate::cluster::slot::{key_slot, SlotId, SlotSet};
use crate::config::{ClusterMode, EngineConfig};
use crate::db::eviction::{PrimeBumpPolicy, PrimeEvictionPolicy};
use crate::db::table::{
    account_object_memory, unlink_entry, DbTable, DbTableStats, SlotStats, TableOps, WatchMarker,
};
use crate::error::{OpError, OpResult};
use crate::journal::{Journal, JournalEntry};
use crate::table::{
    Cursor, ExpirePeriod, Pos, PrimeKey, PrimeValue, VersionClock, MAX_EXPIRE_DEADLINE_SEC,
};
use crate::tiered::TieredStorage;
use crate::types::{DbContext, DbIndex, ObjType, ShardId, DB_ALL};
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

/// Soft budget share of the shard's memory below which table growth starts
/// consulting the byte estimate.
const SOFT_BUDGET_RATIO: f64 = 0.3;

/// Fallback object-size estimate before the slice has learned one.
const DEFAULT_BYTES_PER_OBJECT: i64 = 64;

/// Hook invoked before JSON and hash documents are deleted, so secondary
/// indexes can unindex them.
pub type DocDeletionCallback = Box<dyn Fn(&[u8], &DbContext, &PrimeValue)>;

/// Sink for client-tracking invalidation messages: (client id, key).
pub type TrackingNotifier = Box<dyn Fn(u64, &[u8])>;

/// Event counters of one slice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SliceEvents {
    pub hits: u64,
    pub misses: u64,
    pub mutations: u64,
    pub evicted_keys: u64,
    pub hard_evictions: u64,
    pub expired_keys: u64,
    pub garbage_checked: u64,
    pub garbage_collected: u64,
    pub stash_unloaded: u64,
    pub bumpups: u64,
    pub insertion_rejections: u64,
    pub updates: u64,
}

impl std::ops::AddAssign for SliceEvents {
    fn add_assign(&mut self, o: Self) {
        self.hits += o.hits;
        self.misses += o.misses;
        self.mutations += o.mutations;
        self.evicted_keys += o.evicted_keys;
        self.hard_evictions += o.hard_evictions;
        self.expired_keys += o.expired_keys;
        self.garbage_checked += o.garbage_checked;
        self.garbage_collected += o.garbage_collected;
        self.stash_unloaded += o.stash_unloaded;
        self.bumpups += o.bumpups;
        self.insertion_rejections += o.insertion_rejections;
        self.updates += o.updates;
    }
}

/// Point-in-time statistics of one database.
#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub table: DbTableStats,
    pub key_count: u64,
    pub expire_count: u64,
    pub bucket_count: u64,
    pub table_mem_usage: u64,
}

/// Point-in-time statistics of the whole slice.
#[derive(Debug, Clone, Default)]
pub struct SliceStats {
    pub events: SliceEvents,
    pub db_stats: Vec<DbStats>,
}

/// What a change observer is told.
#[derive(Debug, Clone, Copy)]
pub enum ChangeNotice<'a> {
    /// An entry (or its bucket, for bumps) is about to change in place.
    Mutation { pos: Pos },
    /// A key is about to be inserted.
    NewKey { key: &'a [u8] },
}

/// Observer callback. Invoked before the change becomes visible; the table
/// reference lets observers serialize stale buckets and stamp them sent.
pub type ChangeCallback = Box<dyn FnMut(DbIndex, &ChangeNotice<'_>, &mut DbTable)>;

/// Which counter a lookup feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsMode {
    Read,
    Mutable,
}

/// Whether a lookup must materialize tiered values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    DontLoad,
    Load,
}

/// Result of a read-only lookup.
#[derive(Debug, Clone, Copy)]
pub struct FindResult {
    pub pos: Pos,
    pub exp: Option<Pos>,
}

/// Result of a mutable lookup: position plus the post-update guard.
pub struct MutableFind {
    pub pos: Pos,
    pub exp: Option<Pos>,
    pub updater: AutoUpdater,
}

/// Result of `add_or_find` / `add_or_update`.
#[derive(Debug)]
pub struct AddOrFind {
    pub pos: Pos,
    pub exp: Option<Pos>,
    pub is_new: bool,
    pub updater: AutoUpdater,
}

/// Time unit of an expire command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Sec,
    Msec,
}

/// Conditional flags of an expire update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireFlags {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
}

/// Parsed arguments of an expire update.
#[derive(Debug, Clone, Copy)]
pub struct ExpireParams {
    pub value: i64,
    pub unit: TimeUnit,
    /// True when `value` is an absolute timestamp rather than an offset.
    pub absolute: bool,
    pub flags: ExpireFlags,
    pub persist: bool,
}

impl ExpireParams {
    /// Resolve to (relative ms, absolute ms) against `now_ms`.
    pub fn calculate(&self, now_ms: u64) -> (i64, i64) {
        if self.persist {
            return (0, 0);
        }
        let msec = match self.unit {
            TimeUnit::Sec => self.value.saturating_mul(1000),
            TimeUnit::Msec => self.value,
        };
        let rel = if self.absolute {
            msec - now_ms as i64
        } else {
            msec
        };
        (rel, now_ms as i64 + rel)
    }
}

/// Scoped post-update guard returned from every mutable lookup.
///
/// The caller mutates the value in place, then runs the guard to attribute
/// the heap delta and fire watcher/tracking notifications. Dropping the
/// guard without running or cancelling it, or mutating the slice before
/// running it, is a contract violation and panics.
#[must_use = "run or cancel the post-update guard before further slice mutations"]
#[derive(Debug)]
pub struct AutoUpdater {
    state: Option<UpdaterState>,
}

#[derive(Debug)]
struct UpdaterState {
    db_index: DbIndex,
    key: Bytes,
    orig_heap_size: usize,
    db_size: usize,
    deletion_count: u64,
}

impl AutoUpdater {
    /// Apply the post-update accounting. Must run before any other slice
    /// mutation and before the key can be deleted.
    pub fn run(mut self, slice: &mut DbSlice) {
        let state = self.state.take().expect("guard already consumed");
        slice.post_update(state);
    }

    /// Forget the pending update without applying accounting.
    pub fn cancel(mut self) {
        self.state.take();
    }
}

impl Drop for AutoUpdater {
    fn drop(&mut self) {
        if self.state.is_some() && !std::thread::panicking() {
            panic!("post-update guard dropped without running - this is a bug");
        }
    }
}

/// Statistics of one incremental expire sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteExpiredStats {
    pub deleted: u32,
    pub traversed: u32,
    pub survivor_ttl_sum: u64,
}

/// Resumable state of an asynchronous slot flush.
#[derive(Debug)]
pub struct SlotFlushState {
    slots: SlotSet,
    upper_version: u64,
    cursor: Cursor,
}

/// The slice itself. See the module docs.
pub struct DbSlice {
    shard_id: ShardId,
    caching_mode: bool,
    cluster_enabled: bool,
    expire_allowed: bool,
    is_replica: bool,
    loading: bool,

    enable_heartbeat_eviction: bool,
    max_eviction_per_heartbeat: u32,
    max_segment_to_consider: u32,

    memory_budget: i64,
    soft_budget_limit: i64,

    clock: VersionClock,
    db_arr: Vec<Option<Box<DbTable>>>,
    expire_base: u64,

    events: SliceEvents,
    deletion_count: u64,

    change_cb: Vec<(u64, ChangeCallback)>,
    notifying: bool,

    bumped_items: HashSet<Bytes>,

    client_tracking: HashMap<Bytes, HashSet<u64>>,
    tracking_notifier: Option<TrackingNotifier>,

    doc_del_cb: Option<DocDeletionCallback>,
    journal: Option<Arc<Journal>>,
    tiered: Option<Arc<dyn TieredStorage>>,
}

impl DbSlice {
    pub fn new(shard_id: ShardId, config: &EngineConfig) -> Self {
        let shard_budget = config.shard_memory_budget() as i64;
        let mut slice = Self {
            shard_id,
            caching_mode: config.cache_mode,
            cluster_enabled: config.cluster_mode == ClusterMode::Enabled,
            expire_allowed: true,
            is_replica: false,
            loading: false,
            enable_heartbeat_eviction: config.enable_heartbeat_eviction,
            max_eviction_per_heartbeat: config.max_eviction_per_heartbeat,
            max_segment_to_consider: config.max_segment_to_consider,
            memory_budget: shard_budget,
            soft_budget_limit: (SOFT_BUDGET_RATIO * shard_budget as f64) as i64,
            clock: VersionClock::new(),
            db_arr: Vec::new(),
            expire_base: 0,
            events: SliceEvents::default(),
            deletion_count: 0,
            change_cb: Vec::new(),
            notifying: false,
            bumped_items: HashSet::new(),
            client_tracking: HashMap::new(),
            tracking_notifier: None,
            doc_del_cb: None,
            journal: None,
            tiered: None,
        };
        slice.activate_db(0);
        slice
    }

    // --- plumbing -------------------------------------------------------

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn caching_mode(&self) -> bool {
        self.caching_mode
    }

    pub fn events(&self) -> &SliceEvents {
        &self.events
    }

    pub fn reset_events(&mut self) {
        self.events = SliceEvents::default();
    }

    pub fn memory_budget(&self) -> i64 {
        self.memory_budget
    }

    pub fn set_memory_budget(&mut self, budget: i64) {
        self.memory_budget = budget;
    }

    pub fn expire_base(&self) -> u64 {
        self.expire_base
    }

    pub fn set_expire_allowed(&mut self, allowed: bool) {
        self.expire_allowed = allowed;
    }

    pub fn set_replica(&mut self, replica: bool) {
        self.is_replica = replica;
    }

    /// Snapshot-restore / replication paths bypass conservative growth
    /// checks while this is set.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn set_journal(&mut self, journal: Arc<Journal>) {
        self.journal = Some(journal);
    }

    pub fn journal_handle(&self) -> Option<Arc<Journal>> {
        self.journal.clone()
    }

    pub fn set_tiered_storage(&mut self, tiered: Arc<dyn TieredStorage>) {
        self.tiered = Some(tiered);
    }

    pub fn set_doc_deletion_callback(&mut self, cb: DocDeletionCallback) {
        self.doc_del_cb = Some(cb);
    }

    pub fn set_tracking_notifier(&mut self, cb: TrackingNotifier) {
        self.tracking_notifier = Some(cb);
    }

    pub fn version_clock(&self) -> &VersionClock {
        &self.clock
    }

    pub fn db(&self, db_index: DbIndex) -> Option<&DbTable> {
        self.db_arr.get(db_index as usize).and_then(|d| d.as_deref())
    }

    pub fn db_mut(&mut self, db_index: DbIndex) -> Option<&mut DbTable> {
        self.db_arr
            .get_mut(db_index as usize)
            .and_then(|d| d.as_deref_mut())
    }

    /// Lazily create the table for `db_index`.
    pub fn activate_db(&mut self, db_index: DbIndex) {
        if self.db_arr.len() <= db_index as usize {
            self.db_arr.resize_with(db_index as usize + 1, || None);
        }
        if self.db_arr[db_index as usize].is_none() {
            self.db_arr[db_index as usize] = Some(Box::new(DbTable::new(
                db_index,
                self.cluster_enabled,
                self.clock.clone(),
            )));
        }
    }

    pub fn db_size(&self, db_index: DbIndex) -> usize {
        self.db(db_index).map_or(0, |db| db.prime.len())
    }

    /// Learned per-object heap estimate used by the growth check.
    pub fn bytes_per_object(&self) -> i64 {
        let (mut mem, mut keys) = (0i64, 0u64);
        for db in self.db_arr.iter().flatten() {
            mem += db.stats.obj_memory_usage;
            keys += db.prime.len() as u64;
        }
        if keys == 0 {
            DEFAULT_BYTES_PER_OBJECT
        } else {
            (mem / keys as i64).max(1)
        }
    }

    pub fn get_stats(&self) -> SliceStats {
        let mut stats = SliceStats {
            events: self.events,
            db_stats: vec![DbStats::default(); self.db_arr.len()],
        };
        for (i, db) in self.db_arr.iter().enumerate() {
            let Some(db) = db else { continue };
            stats.db_stats[i] = DbStats {
                table: db.stats.clone(),
                key_count: db.prime.len() as u64,
                expire_count: db.expire.len() as u64,
                bucket_count: db.prime.bucket_count() as u64,
                table_mem_usage: (db.prime.mem_usage() + db.expire.mem_usage()) as u64,
            };
        }
        stats
    }

    pub fn get_slot_stats(&self, slot: SlotId) -> SlotStats {
        self.db(0)
            .and_then(|db| db.slots_stats.get(slot as usize).copied())
            .unwrap_or_default()
    }

    // --- read path ------------------------------------------------------

    pub fn find_read_only(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<FindResult> {
        self.find_internal(cntx, key, None, StatsMode::Read, LoadMode::DontLoad)
    }

    pub fn find_read_only_typed(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: ObjType,
    ) -> OpResult<Pos> {
        self.find_internal(cntx, key, Some(req_type), StatsMode::Read, LoadMode::DontLoad)
            .map(|r| r.pos)
    }

    /// Like `find_read_only_typed`, forcing a tiered load of external
    /// values. May suspend cooperatively.
    pub fn find_and_fetch_read_only(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: ObjType,
    ) -> OpResult<Pos> {
        self.find_internal(cntx, key, Some(req_type), StatsMode::Read, LoadMode::Load)
            .map(|r| r.pos)
    }

    pub fn find_mutable(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<MutableFind> {
        self.find_mutable_internal(cntx, key, None, LoadMode::DontLoad)
    }

    pub fn find_mutable_typed(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: ObjType,
    ) -> OpResult<MutableFind> {
        self.find_mutable_internal(cntx, key, Some(req_type), LoadMode::DontLoad)
    }

    pub fn find_and_fetch_mutable(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: ObjType,
    ) -> OpResult<MutableFind> {
        self.find_mutable_internal(cntx, key, Some(req_type), LoadMode::Load)
    }

    fn find_mutable_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: Option<ObjType>,
        load_mode: LoadMode,
    ) -> OpResult<MutableFind> {
        let res = self.find_internal(cntx, key, req_type, StatsMode::Mutable, load_mode)?;
        self.pre_update(cntx.db_index, res.pos);
        Ok(MutableFind {
            pos: res.pos,
            exp: res.exp,
            updater: self.make_updater(cntx.db_index, key, res.pos),
        })
    }

    fn make_updater(&self, db_index: DbIndex, key: &[u8], pos: Pos) -> AutoUpdater {
        let db = self.db(db_index).expect("updater over a live db");
        let orig_heap_size = db
            .prime
            .value_at(pos)
            .map(|v| v.malloc_used())
            .unwrap_or(0);
        AutoUpdater {
            state: Some(UpdaterState {
                db_index,
                key: Bytes::copy_from_slice(key),
                orig_heap_size,
                db_size: self.db_size(db_index),
                deletion_count: self.deletion_count,
            }),
        }
    }

    fn find_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_type: Option<ObjType>,
        stats_mode: StatsMode,
        load_mode: LoadMode,
    ) -> OpResult<FindResult> {
        let miss = |events: &mut SliceEvents| match stats_mode {
            StatsMode::Read => events.misses += 1,
            StatsMode::Mutable => events.mutations += 1,
        };

        let Some(db) = self.db(cntx.db_index) else {
            miss(&mut self.events);
            return Err(OpError::KeyNotFound);
        };

        let Some(mut pos) = db.prime.find(key) else {
            miss(&mut self.events);
            return Err(OpError::KeyNotFound);
        };

        // Type mismatch is not a miss: the key exists.
        if let Some(req) = req_type {
            let stored = db.prime.value_at(pos).expect("found position").obj_type();
            if stored != req {
                return Err(OpError::WrongType);
            }
        }

        if load_mode == LoadMode::Load {
            pos = match self.fetch_external(cntx, key, pos) {
                Ok(pos) => pos,
                Err(e) => {
                    if e == OpError::KeyNotFound {
                        miss(&mut self.events);
                    }
                    return Err(e);
                }
            };
        }

        let db = self.db(cntx.db_index).expect("db checked above");
        let mut exp = None;
        if db.prime.value_at(pos).expect("live position").has_expire() {
            match self.expire_if_needed(cntx, pos) {
                Some((p, e)) => {
                    pos = p;
                    exp = Some(e);
                }
                None => {
                    miss(&mut self.events);
                    return Err(OpError::KeyNotFound);
                }
            }
        }

        if self.caching_mode && !self.bumped_items.contains(key) {
            pos = self.bump_entry(cntx.db_index, key, pos);
        }

        let db = self.db_mut(cntx.db_index).expect("db checked above");
        db.top_keys.touch(key);

        match stats_mode {
            StatsMode::Read => {
                self.events.hits += 1;
                if self.cluster_enabled {
                    let db = self.db_mut(cntx.db_index).expect("live db");
                    db.slots_stats[key_slot(key) as usize].total_reads += 1;
                }
            }
            StatsMode::Mutable => self.events.mutations += 1,
        }

        Ok(FindResult { pos, exp })
    }

    /// Cancel pending I/O or load the external body. Positions are
    /// re-derived afterwards because the load may suspend.
    fn fetch_external(&mut self, cntx: &DbContext, key: &[u8], pos: Pos) -> OpResult<Pos> {
        let Some(tiered) = self.tiered.clone() else {
            return Ok(pos);
        };
        let db = self.db(cntx.db_index).expect("live db");
        let value = db.prime.value_at(pos).expect("live position");

        if value.has_io_pending() {
            tiered.cancel_io(cntx.db_index, key);
            let db = self.db_mut(cntx.db_index).expect("live db");
            db.prime
                .value_mut_at(pos)
                .expect("live position")
                .set_io_pending(false);
            return Ok(pos);
        }

        let Some(locator) = value.external_locator() else {
            return Ok(pos);
        };
        let had_expire = value.has_expire();
        let had_flag = value.has_mc_flag();

        // The load can suspend; everything below re-reads the table.
        let mut loaded = tiered.load(cntx.db_index, key, locator)?;
        loaded.set_expire(had_expire);
        loaded.set_mc_flag(had_flag);

        let heap = loaded.malloc_used() as i64;
        let db = self.db_mut(cntx.db_index).expect("live db");
        let Some(pos) = db.prime.find(key) else {
            return Err(OpError::KeyNotFound);
        };
        let obj_type = loaded.obj_type();
        *db.prime.value_mut_at(pos).expect("just found") = loaded;
        db.stats.tiered_entries -= 1;
        db.stats.tiered_size -= locator.1 as u64;
        let DbTable {
            stats, slots_stats, ..
        } = &mut *db;
        account_object_memory(key, obj_type, heap, stats, slots_stats);
        Ok(pos)
    }

    /// Caching-mode bump: observers first, then the table move.
    fn bump_entry(&mut self, db_index: DbIndex, key: &[u8], pos: Pos) -> Pos {
        if !self.change_cb.is_empty() {
            let upper_bound = self.change_cb.last().expect("non-empty").0;
            let mut stale = Vec::new();
            {
                let db = self.db(db_index).expect("live db");
                db.prime
                    .cvc_upon_bump(upper_bound, pos, |bucket_pos| stale.push(bucket_pos));
            }
            if !stale.is_empty() {
                debug!(db = db_index, buckets = stale.len(), "running bump callbacks");
                let mut cbs = std::mem::take(&mut self.change_cb);
                self.notifying = true;
                {
                    let db = self.db_arr[db_index as usize]
                        .as_deref_mut()
                        .expect("live db");
                    for bucket_pos in stale {
                        for (_, cb) in cbs.iter_mut() {
                            cb(db_index, &ChangeNotice::Mutation { pos: bucket_pos }, db);
                        }
                    }
                }
                self.notifying = false;
                self.change_cb = cbs;
            }
        }

        let Self {
            db_arr,
            bumped_items,
            events,
            ..
        } = self;
        let db = db_arr[db_index as usize].as_deref_mut().expect("live db");
        let policy = PrimeBumpPolicy::new(bumped_items);
        let new_pos = db.prime.bump_up(pos, &policy);
        events.bumpups += 1;
        events.stash_unloaded = db.prime.stash_unloaded();
        bumped_items.insert(Bytes::copy_from_slice(key));
        new_pos
    }

    // --- write path -----------------------------------------------------

    pub fn add_or_find(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<AddOrFind> {
        self.add_or_find_internal(cntx, key, LoadMode::DontLoad)
    }

    pub fn add_or_find_and_fetch(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<AddOrFind> {
        self.add_or_find_internal(cntx, key, LoadMode::Load)
    }

    fn add_or_find_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        load_mode: LoadMode,
    ) -> OpResult<AddOrFind> {
        self.activate_db(cntx.db_index);

        match self.find_internal(cntx, key, None, StatsMode::Mutable, load_mode) {
            Ok(res) => {
                self.pre_update(cntx.db_index, res.pos);
                return Ok(AddOrFind {
                    pos: res.pos,
                    exp: res.exp,
                    is_new: false,
                    updater: self.make_updater(cntx.db_index, key, res.pos),
                });
            }
            Err(OpError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }

        // New entry: observers may pre-stage work for the key.
        self.notify_new_key(cntx.db_index, key);

        // Loading and replication bypass the conservative growth estimate:
        // restoring a snapshot grows a different segment tree than the one
        // that produced it, and must not fail for that reason alone.
        let apply_memory_limit = !self.is_replica && !self.loading;
        let bytes_per_object = self.bytes_per_object();
        let can_evict = self.caching_mode && !self.is_replica;
        let budget = self.memory_budget - key.len() as i64;
        let caching_mode = self.caching_mode;

        let inserted;
        let deleted_keys;
        {
            let Self {
                db_arr,
                events,
                journal,
                expire_base,
                expire_allowed,
                cluster_enabled,
                soft_budget_limit,
                memory_budget,
                ..
            } = self;
            let db = db_arr[cntx.db_index as usize]
                .as_deref_mut()
                .expect("activated above");
            let DbTable {
                prime,
                expire,
                mcflag,
                stats,
                slots_stats,
                trans_locks,
                ..
            } = &mut *db;

            let mut policy = PrimeEvictionPolicy::new(
                *cntx,
                can_evict,
                budget,
                *soft_budget_limit,
                apply_memory_limit,
                bytes_per_object,
                *expire_base,
                *expire_allowed,
                *cluster_enabled,
                TableOps {
                    expire,
                    mcflag,
                    stats,
                    slots_stats,
                },
                trans_locks,
                journal.as_deref(),
            );

            // Over budget outside caching mode: reject conservatively.
            if apply_memory_limit && !caching_mode && policy.mem_budget() < 0 {
                debug!(budget = policy.mem_budget(), "insert over budget");
                events.insertion_rejections += 1;
                return Err(OpError::OutOfMemory);
            }

            inserted =
                prime.insert_new(PrimeKey::new(key), PrimeValue::default(), &mut policy);

            events.garbage_collected += policy.reclaimed() as u64;
            events.garbage_checked += policy.checked() as u64;
            events.evicted_keys += policy.evicted() as u64;
            events.stash_unloaded = prime.stash_unloaded();
            *memory_budget = policy.mem_budget();
            deleted_keys = policy.into_deleted_keys();
        }

        for deleted in deleted_keys {
            self.send_tracking_invalidation(&deleted);
            self.bumped_items.remove(&deleted);
        }

        let pos = match inserted {
            Ok(pos) => pos,
            Err(_) => {
                debug!("insert rejected by table");
                self.events.insertion_rejections += 1;
                return Err(OpError::OutOfMemory);
            }
        };

        let db = self.db_mut(cntx.db_index).expect("activated above");
        let key_obj = db.prime.key_at(pos).expect("just inserted");
        let key_inline = key_obj.is_inline();
        let key_heap = key_obj.malloc_used() as i64;
        db.stats.inline_keys += key_inline as u64;
        let DbTable {
            stats, slots_stats, ..
        } = &mut *db;
        account_object_memory(key, ObjType::String, key_heap, stats, slots_stats);
        if !slots_stats.is_empty() {
            slots_stats[key_slot(key) as usize].key_count += 1;
        }

        Ok(AddOrFind {
            pos,
            exp: None,
            is_new: true,
            updater: self.make_updater(cntx.db_index, key, pos),
        })
    }

    /// Insert a fresh key with a value and optional absolute deadline.
    /// Errors if the key exists.
    pub fn add_new(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: PrimeValue,
        expire_at_ms: u64,
    ) -> OpResult<MutableFind> {
        let res = self.add_or_update_internal(cntx, key, value, expire_at_ms, false)?;
        debug_assert!(res.is_new, "add_new over an existing key");
        Ok(MutableFind {
            pos: res.pos,
            exp: res.exp,
            updater: res.updater,
        })
    }

    /// Upsert: insert or overwrite, replacing any expiration.
    pub fn add_or_update(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: PrimeValue,
        expire_at_ms: u64,
    ) -> OpResult<AddOrFind> {
        self.add_or_update_internal(cntx, key, value, expire_at_ms, true)
    }

    fn add_or_update_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: PrimeValue,
        expire_at_ms: u64,
        force_update: bool,
    ) -> OpResult<AddOrFind> {
        let mut res = self.add_or_find(cntx, key)?;
        if !res.is_new && !force_update {
            return Ok(res);
        }

        let db = self.db_mut(cntx.db_index).expect("live db");
        let entry = db.prime.value_mut_at(res.pos).expect("live position");
        let had_expire = entry.has_expire();
        let was_packed_blob =
            entry.is_packed() && matches!(entry.obj_type(), ObjType::Hash | ObjType::ZSet);
        let was_external = entry.external_locator();
        *entry = value;
        entry.set_expire(had_expire);
        let now_packed_blob =
            entry.is_packed() && matches!(entry.obj_type(), ObjType::Hash | ObjType::ZSet);
        let now_external = entry.external_locator();
        match (was_packed_blob, now_packed_blob) {
            (false, true) => db.stats.listpack_blob_cnt += 1,
            (true, false) => db.stats.listpack_blob_cnt -= 1,
            _ => {}
        }
        if let Some((_, len)) = was_external {
            db.stats.tiered_entries -= 1;
            db.stats.tiered_size -= len as u64;
        }
        if let Some((_, len)) = now_external {
            db.stats.tiered_entries += 1;
            db.stats.tiered_size += len as u64;
        }

        if expire_at_ms != 0 {
            let delta = expire_at_ms.saturating_sub(self.expire_base);
            let db = self.db_mut(cntx.db_index).expect("live db");
            let key_obj = db.prime.key_at(res.pos).expect("live position").clone();
            match res.exp {
                Some(exp_pos) if force_update => {
                    *db.expire.value_mut_at(exp_pos).expect("live expire") =
                        ExpirePeriod::new(delta);
                }
                _ => {
                    let exp_pos = db.expire.insert_simple(key_obj, ExpirePeriod::new(delta));
                    res.exp = Some(exp_pos);
                }
            }
            db.prime
                .value_mut_at(res.pos)
                .expect("live position")
                .set_expire(true);
        }

        Ok(res)
    }

    /// Set or clear the memcached flags of the key at `pos`.
    pub fn set_mc_flag(&mut self, db_index: DbIndex, pos: Pos, flag: u32) {
        let db = self.db_mut(db_index).expect("live db");
        let key = db.prime.key_at(pos).expect("live position").clone();
        if flag == 0 {
            if db.mcflag.erase_key(key.as_bytes()).is_none() {
                error!(
                    key = %String::from_utf8_lossy(key.as_bytes()),
                    "inconsistent state: mcflag entry should be present"
                );
            }
            db.prime
                .value_mut_at(pos)
                .expect("live position")
                .set_mc_flag(false);
        } else {
            db.mcflag.upsert(key, flag);
            db.prime
                .value_mut_at(pos)
                .expect("live position")
                .set_mc_flag(true);
        }
    }

    /// The memcached flags of the key at `pos`, zero when unset.
    pub fn get_mc_flag(&self, db_index: DbIndex, pos: Pos) -> u32 {
        let db = self.db(db_index).expect("live db");
        let value = db.prime.value_at(pos).expect("live position");
        if !value.has_mc_flag() {
            return 0;
        }
        let key = db.prime.key_at(pos).expect("live position");
        match db.mcflag.find(key.as_bytes()) {
            Some(flag_pos) => *db.mcflag.value_at(flag_pos).expect("found position"),
            None => {
                error!(
                    key = %String::from_utf8_lossy(key.as_bytes()),
                    "inconsistent state: mcflag entry should be present"
                );
                0
            }
        }
    }

    // --- expiration -----------------------------------------------------

    /// Absolute deadline of an expire-table entry.
    pub fn expire_time(&self, db_index: DbIndex, exp_pos: Pos) -> u64 {
        let db = self.db(db_index).expect("live db");
        let period = db.expire.value_at(exp_pos).expect("live expire entry");
        self.expire_base + period.duration_ms()
    }

    /// Insert an expire entry for the key at `pos`.
    pub fn add_expire(&mut self, db_index: DbIndex, pos: Pos, at_ms: u64) {
        let delta = at_ms.saturating_sub(self.expire_base);
        let db = self.db_mut(db_index).expect("live db");
        let key = db.prime.key_at(pos).expect("live position").clone();
        db.expire.insert_simple(key, ExpirePeriod::new(delta));
        db.prime
            .value_mut_at(pos)
            .expect("live position")
            .set_expire(true);
    }

    /// Remove the expire entry of the key at `pos`, if any.
    pub fn remove_expire(&mut self, db_index: DbIndex, pos: Pos) -> bool {
        let db = self.db_mut(db_index).expect("live db");
        if !db.prime.value_at(pos).expect("live position").has_expire() {
            return false;
        }
        let key = db.prime.key_at(pos).expect("live position").clone();
        let erased = db.expire.erase_key(key.as_bytes()).is_some();
        debug_assert!(erased, "has-expire bit without an expire entry");
        db.prime
            .value_mut_at(pos)
            .expect("live position")
            .set_expire(false);
        true
    }

    /// Apply an expire update with full flag semantics. Returns the new
    /// absolute deadline, 0 for persist, or -1 when the key was deleted by
    /// a past deadline.
    pub fn update_expire(
        &mut self,
        cntx: &DbContext,
        pos: Pos,
        exp_pos: Option<Pos>,
        params: &ExpireParams,
    ) -> OpResult<i64> {
        if params.persist {
            self.remove_expire(cntx.db_index, pos);
            return Ok(0);
        }

        let (rel_msec, abs_msec) = params.calculate(cntx.time_now_ms);
        if rel_msec > (MAX_EXPIRE_DEADLINE_SEC * 1000) as i64 {
            return Err(OpError::OutOfRange);
        }

        if rel_msec <= 0 {
            // Past deadline: delete now.
            assert!(self.del(cntx.db_index, pos), "delete of a live position");
            return Ok(-1);
        }

        if let Some(exp_pos) = exp_pos {
            let current = self.expire_time(cntx.db_index, exp_pos) as i64;
            if params.flags.nx {
                return Err(OpError::Skipped);
            }
            if params.flags.lt && current <= abs_msec {
                return Err(OpError::Skipped);
            }
            if params.flags.gt && current >= abs_msec {
                return Err(OpError::Skipped);
            }
            let delta = (abs_msec as u64).saturating_sub(self.expire_base);
            let db = self.db_mut(cntx.db_index).expect("live db");
            *db.expire.value_mut_at(exp_pos).expect("live expire") = ExpirePeriod::new(delta);
            Ok(abs_msec)
        } else {
            if params.flags.xx {
                return Err(OpError::Skipped);
            }
            self.add_expire(cntx.db_index, pos, abs_msec as u64);
            Ok(abs_msec)
        }
    }

    /// Check the deadline of the entry at `pos` (which must carry one) and
    /// delete it when due. Returns the (possibly unchanged) positions, or
    /// None when the entry was expired away.
    pub fn expire_if_needed(&mut self, cntx: &DbContext, pos: Pos) -> Option<(Pos, Pos)> {
        let db = self.db(cntx.db_index).expect("live db");
        let value = db.prime.value_at(pos).expect("live position");
        debug_assert!(value.has_expire());

        let key = db.prime.key_at(pos).expect("live position");
        let key_bytes = Bytes::copy_from_slice(key.as_bytes());
        let exp_pos = db
            .expire
            .find(&key_bytes)
            .expect("has-expire bit without an expire entry");
        let deadline = self.expire_time(cntx.db_index, exp_pos);

        // Replicas never expire on their own; the master journals expiries.
        if cntx.time_now_ms < deadline || self.is_replica || !self.expire_allowed {
            return Some((pos, exp_pos));
        }

        if let Some(journal) = &self.journal {
            let slot = self.cluster_enabled.then(|| key_slot(&key_bytes));
            journal.record(JournalEntry::expired(cntx.db_index, slot, &key_bytes));
        }
        self.run_doc_deletion_hook(cntx, pos);
        self.perform_deletion(cntx.db_index, pos);
        self.events.expired_keys += 1;
        None
    }

    /// Eagerly sweep every database for due entries. Used when expiry is
    /// re-enabled after being suspended.
    pub fn expire_all_if_needed(&mut self, now_ms: u64) {
        for db_index in 0..self.db_arr.len() as DbIndex {
            if self.db(db_index).is_none() {
                continue;
            }
            let mut cursor = Cursor::start();
            loop {
                let Some(db) = self.db(db_index) else { break };
                let (positions, next) = db.expire.scan_bucket(cursor);
                let keys: Vec<Bytes> = positions
                    .iter()
                    .filter_map(|&p| db.expire.key_at(p))
                    .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                    .collect();
                for key in keys {
                    let cntx = DbContext::new(db_index, now_ms);
                    let pos = self.db(db_index).and_then(|db| db.prime.find(&key));
                    let Some(pos) = pos else {
                        error!(
                            key = %String::from_utf8_lossy(&key),
                            "expire entry not found in prime table"
                        );
                        continue;
                    };
                    self.expire_if_needed(&cntx, pos);
                }
                if next.is_done() {
                    break;
                }
                cursor = next;
            }
        }
    }

    /// One incremental expire sweep: traverse up to `count` expire-table
    /// buckets from the saved cursor, deleting due entries. The second two
    /// thirds of the budget run only while the deletion rate stays above a
    /// quarter of traversals.
    pub fn delete_expired_step(&mut self, cntx: &DbContext, count: u32) -> DeleteExpiredStats {
        let mut stats = DeleteExpiredStats::default();

        let mut step = |slice: &mut Self, stats: &mut DeleteExpiredStats| {
            let Some(db) = slice.db(cntx.db_index) else {
                return;
            };
            let mut cursor = db.expire_cursor;
            if cursor.is_done() {
                cursor = Cursor::start();
            }
            let (positions, next) = db.expire.scan_bucket(cursor);
            let mut keys = Vec::with_capacity(positions.len());
            for p in positions {
                if let Some((k, period)) = db.expire.pair_at(p) {
                    keys.push((Bytes::copy_from_slice(k.as_bytes()), *period));
                }
            }
            for (key, period) in keys {
                let db = slice.db(cntx.db_index).expect("live db");
                if !db.trans_locks.check(
                    crate::db::locks::LockMode::Exclusive,
                    [key.as_ref()],
                ) {
                    continue;
                }
                stats.traversed += 1;
                let deadline = slice.expire_base + period.duration_ms();
                if cntx.time_now_ms >= deadline {
                    let Some(pos) = db.prime.find(&key) else {
                        error!(
                            key = %String::from_utf8_lossy(&key),
                            "expire entry not found in prime table"
                        );
                        continue;
                    };
                    if slice.expire_if_needed(cntx, pos).is_none() {
                        stats.deleted += 1;
                    }
                } else {
                    stats.survivor_ttl_sum += deadline - cntx.time_now_ms;
                }
            }
            if let Some(db) = slice.db_mut(cntx.db_index) {
                db.expire_cursor = next;
            }
        };

        let mut i = 0;
        while i < count / 3 {
            step(self, &mut stats);
            i += 1;
        }
        if stats.deleted * 4 > stats.traversed {
            while i < count {
                step(self, &mut stats);
                i += 1;
            }
        }
        stats
    }

    // --- deletion -------------------------------------------------------

    /// Delete the entry at `pos`. Returns false for an invalid position.
    pub fn del(&mut self, db_index: DbIndex, pos: Pos) -> bool {
        let Some(db) = self.db(db_index) else {
            return false;
        };
        if !db.prime.is_occupied(pos) {
            return false;
        }

        let cntx = DbContext::new(db_index, 0);
        self.run_doc_deletion_hook(&cntx, pos);
        let key = {
            let db = self.db(db_index).expect("live db");
            Bytes::copy_from_slice(db.prime.key_at(pos).expect("occupied").as_bytes())
        };
        self.bumped_items.remove(&key);
        self.perform_deletion(db_index, pos);
        self.deletion_count += 1;
        true
    }

    fn run_doc_deletion_hook(&self, cntx: &DbContext, pos: Pos) {
        let Some(doc_del) = &self.doc_del_cb else {
            return;
        };
        let db = self.db(cntx.db_index).expect("live db");
        let Some((key, value)) = db.prime.pair_at(pos) else {
            return;
        };
        if matches!(value.obj_type(), ObjType::Json | ObjType::Hash) {
            doc_del(key.as_bytes(), cntx, value);
        }
    }

    /// Unlink the entry at `pos` from every table, free its tiered body and
    /// notify tracking clients. The workhorse behind del/expire/evict.
    pub fn perform_deletion(&mut self, db_index: DbIndex, pos: Pos) {
        let Self {
            db_arr,
            memory_budget,
            tiered,
            ..
        } = self;
        let db = db_arr[db_index as usize].as_deref_mut().expect("live db");
        let DbTable {
            prime,
            expire,
            mcflag,
            stats,
            slots_stats,
            ..
        } = db;

        let mut ops = TableOps {
            expire,
            mcflag,
            stats,
            slots_stats,
        };
        let (key, value) = unlink_entry(prime, pos, &mut ops);
        *memory_budget += (key.malloc_used() + value.malloc_used()) as i64;

        if let Some(tiered) = tiered {
            if let Some(locator) = value.external_locator() {
                tiered.free(locator);
            }
            if value.has_io_pending() {
                tiered.cancel_io(db_index, key.as_bytes());
            }
        }

        let key = Bytes::copy_from_slice(key.as_bytes());
        self.send_tracking_invalidation(&key);
    }

    // --- flushes --------------------------------------------------------

    /// Drop one database (or all), preserving transactional locks.
    pub fn flush_db(&mut self, db_index: DbIndex) {
        self.client_tracking.clear();
        debug_assert!(
            self.bumped_items.is_empty(),
            "flush inside a command boundary"
        );

        let indexes: Vec<DbIndex> = if db_index == DB_ALL {
            (0..self.db_arr.len() as DbIndex)
                .filter(|&i| self.db_arr[i as usize].is_some())
                .collect()
        } else {
            vec![db_index]
        };

        for idx in indexes {
            if self.db(idx).is_none() {
                continue;
            }
            self.invalidate_db_watches(idx);
            let old = self.db_arr[idx as usize].take().expect("checked above");
            self.db_arr[idx as usize] = Some(Box::new(DbTable::new(
                idx,
                self.cluster_enabled,
                self.clock.clone(),
            )));
            // Multi-transaction locks must survive the flush.
            let fresh = self.db_arr[idx as usize].as_deref_mut().expect("just set");
            fresh.trans_locks = old.trans_locks;

            if let Some(tiered) = &self.tiered {
                tiered.cancel_all_ios(idx);
                for (_, _, value) in old.prime.iter() {
                    if let Some(locator) = value.external_locator() {
                        tiered.free(locator);
                    }
                }
            }
        }
    }

    /// Begin an asynchronous slot flush. Entries written after this call
    /// carry bucket versions at or above the captured bound and survive.
    pub fn begin_flush_slots(&mut self, slots: SlotSet) -> SlotFlushState {
        self.invalidate_slot_watches(&slots);
        SlotFlushState {
            slots,
            upper_version: self.clock.next(),
            cursor: Cursor::start(),
        }
    }

    /// Run up to `max_buckets` buckets of the flush. Returns true when the
    /// traversal is complete.
    pub fn run_flush_slots_chunk(&mut self, state: &mut SlotFlushState, max_buckets: usize) -> bool {
        if state.slots.is_empty() {
            return true;
        }
        for _ in 0..max_buckets {
            if state.cursor.is_done() {
                return true;
            }
            let Some(db) = self.db(0) else {
                return true;
            };
            let (positions, next) = db.prime.scan_bucket(state.cursor);
            state.cursor = next;

            // The version gate is evaluated for the whole bucket before any
            // deletion: deleting advances the bucket version, which must not
            // shield the bucket's remaining entries.
            let mut doomed = Vec::new();
            if let Some(&first) = positions.first() {
                if db.prime.bucket_version(first) < state.upper_version {
                    for pos in positions {
                        let Some((key, _)) = db.prime.pair_at(pos) else {
                            continue;
                        };
                        if state.slots.contains(key_slot(key.as_bytes())) {
                            doomed.push(pos);
                        }
                    }
                }
            }
            for pos in doomed {
                self.perform_deletion(0, pos);
            }
        }
        state.cursor.is_done()
    }

    /// Flush the given slots to completion, synchronously. The engine wraps
    /// `begin`/`chunk` instead, yielding between chunks.
    pub fn flush_slots_sync(&mut self, slots: SlotSet) {
        let mut state = self.begin_flush_slots(slots);
        while !self.run_flush_slots_chunk(&mut state, 100) {}
    }

    // --- heartbeat eviction --------------------------------------------

    /// Evict cold entries until `increase_goal_bytes` are reclaimed or the
    /// per-heartbeat cap is hit. Walks slots high-to-low, buckets
    /// high-to-low, over a few randomly chosen segments. Journal entries
    /// for the batch are written after the scan completes.
    pub fn free_mem_with_eviction_step(
        &mut self,
        db_index: DbIndex,
        increase_goal_bytes: usize,
    ) -> usize {
        if !self.caching_mode
            || !self.expire_allowed
            || !self.enable_heartbeat_eviction
            || self.is_replica
        {
            return 0;
        }
        let Some(db) = self.db(db_index) else {
            return 0;
        };

        let num_segments = db.prime.segment_count();
        let starting_segment = rand::thread_rng().gen_range(0..num_segments) as u32;
        let max_per_beat = self.max_eviction_per_heartbeat as usize;
        let max_segments = self.max_segment_to_consider as usize;

        let mut evicted = 0usize;
        let mut freed = 0usize;
        let mut keys_to_journal: Vec<Bytes> = Vec::new();

        'outer: for slot_id in (0..crate::table::SLOTS_PER_BUCKET as u8).rev() {
            for bucket_id in (0..crate::table::TOTAL_BUCKETS as u8).rev() {
                let mut segment = starting_segment;
                for _ in 0..max_segments.min(num_segments) {
                    let db = self.db(db_index).expect("live db");
                    let pos = Pos {
                        segment,
                        bucket: bucket_id,
                        slot: slot_id,
                    };
                    segment = (segment + 1) % num_segments as u32;

                    let Some((key, value)) = db.prime.pair_at(pos) else {
                        continue;
                    };
                    if key.is_sticky() {
                        continue;
                    }
                    let key_bytes = Bytes::copy_from_slice(key.as_bytes());
                    if db.trans_locks.is_locked(&key_bytes) {
                        continue;
                    }

                    freed += key.malloc_used() + value.malloc_used() + 32;
                    if self.journal.is_some() {
                        keys_to_journal.push(key_bytes);
                    }
                    self.perform_deletion(db_index, pos);
                    evicted += 1;

                    if evicted == max_per_beat || freed >= increase_goal_bytes {
                        break 'outer;
                    }
                }
            }
        }

        // The batch is journaled only after the walk; entries never
        // interleave with scan progress.
        if let Some(journal) = &self.journal {
            for key in &keys_to_journal {
                let slot = self.cluster_enabled.then(|| key_slot(key));
                journal.record(JournalEntry::expired(db_index, slot, key));
            }
        }

        self.events.evicted_keys += evicted as u64;
        self.events.hard_evictions += evicted as u64;
        debug!(evicted, freed, goal = increase_goal_bytes, "heartbeat eviction");
        freed
    }

    // --- change notification -------------------------------------------

    /// Register an observer. Returns its version: all buckets mutated from
    /// here on will be stamped above it.
    pub fn register_on_change(&mut self, cb: ChangeCallback) -> u64 {
        assert!(
            !self.notifying,
            "re-entrant change-callback registration during a notify"
        );
        let version = self.clock.next();
        self.change_cb.push((version, cb));
        version
    }

    pub fn unregister_on_change(&mut self, id: u64) {
        assert!(!self.notifying, "unregister during a notify");
        let before = self.change_cb.len();
        self.change_cb.retain(|(v, _)| *v != id);
        if self.change_cb.len() == before {
            error!(id, "could not find change callback to unregister");
        }
    }

    /// Replay a mutation notice to exactly the callbacks whose version lies
    /// in (bucket_version, upper_bound).
    pub fn flush_change_to_earlier_callbacks(
        &mut self,
        db_index: DbIndex,
        pos: Pos,
        upper_bound: u64,
    ) {
        let mut cbs = std::mem::take(&mut self.change_cb);
        self.notifying = true;
        {
            let db = self.db_arr[db_index as usize]
                .as_deref_mut()
                .expect("live db");
            let bucket_version = db.prime.bucket_version(pos);
            debug!(
                db = db_index,
                bucket_version, upper_bound, "flushing change to earlier callbacks"
            );
            for (version, cb) in cbs.iter_mut() {
                debug_assert!(*version <= upper_bound);
                if *version == upper_bound {
                    break;
                }
                if bucket_version < *version {
                    cb(db_index, &ChangeNotice::Mutation { pos }, db);
                }
            }
        }
        self.notifying = false;
        self.change_cb = cbs;
    }

    /// Mutation notices plus the version stamp, before an in-place update.
    fn pre_update(&mut self, db_index: DbIndex, pos: Pos) {
        if !self.change_cb.is_empty() {
            let mut cbs = std::mem::take(&mut self.change_cb);
            self.notifying = true;
            {
                let db = self.db_arr[db_index as usize]
                    .as_deref_mut()
                    .expect("live db");
                for (_, cb) in cbs.iter_mut() {
                    cb(db_index, &ChangeNotice::Mutation { pos }, db);
                }
            }
            self.notifying = false;
            self.change_cb = cbs;
        }
        let db = self.db_mut(db_index).expect("live db");
        db.prime.stamp_bucket(pos);
    }

    fn notify_new_key(&mut self, db_index: DbIndex, key: &[u8]) {
        if self.change_cb.is_empty() {
            return;
        }
        let mut cbs = std::mem::take(&mut self.change_cb);
        self.notifying = true;
        {
            let db = self.db_arr[db_index as usize]
                .as_deref_mut()
                .expect("live db");
            for (_, cb) in cbs.iter_mut() {
                cb(db_index, &ChangeNotice::NewKey { key }, db);
            }
        }
        self.notifying = false;
        self.change_cb = cbs;
    }

    fn post_update(&mut self, state: UpdaterState) {
        // These two checks catch mutations that slipped in before the guard
        // ran; both are programming errors.
        assert_eq!(
            state.db_size,
            self.db_size(state.db_index),
            "post-update ran after the db changed size"
        );
        assert_eq!(
            state.deletion_count, self.deletion_count,
            "post-update ran after a deletion was issued"
        );

        // Positions may have been bumped; the key is the source of truth.
        let db = self.db(state.db_index).expect("live db");
        let pos = db
            .prime
            .find(&state.key)
            .expect("key was removed before the post-update guard ran - this is a bug");

        let db = self.db_mut(state.db_index).expect("live db");
        let value = db.prime.value_at(pos).expect("live position");
        let delta = value.malloc_used() as i64 - state.orig_heap_size as i64;
        let obj_type = value.obj_type();
        let DbTable {
            stats,
            slots_stats,
            watched_keys,
            ..
        } = &mut *db;
        account_object_memory(&state.key, obj_type, delta, stats, slots_stats);

        if let Some(watchers) = watched_keys.remove(state.key.as_ref()) {
            for w in watchers {
                w.mark_dirty();
            }
        }

        if !slots_stats.is_empty() {
            slots_stats[key_slot(&state.key) as usize].total_writes += 1;
        }

        self.memory_budget -= delta;
        self.events.updates += 1;
        self.send_tracking_invalidation(&state.key);
    }

    // --- locks ----------------------------------------------------------

    pub fn acquire_locks<'k>(
        &mut self,
        db_index: DbIndex,
        mode: crate::db::locks::LockMode,
        keys: impl IntoIterator<Item = &'k [u8]>,
    ) -> bool {
        self.activate_db(db_index);
        let db = self.db_mut(db_index).expect("activated");
        let acquired = db.trans_locks.acquire(mode, keys);
        debug!(db = db_index, acquired, "acquire locks");
        acquired
    }

    pub fn release_locks<'k>(
        &mut self,
        db_index: DbIndex,
        mode: crate::db::locks::LockMode,
        keys: impl IntoIterator<Item = &'k [u8]>,
    ) {
        let db = self.db_mut(db_index).expect("live db");
        db.trans_locks.release(mode, keys);
    }

    pub fn check_lock(
        &self,
        db_index: DbIndex,
        mode: crate::db::locks::LockMode,
        key: &[u8],
    ) -> bool {
        self.db(db_index)
            .map_or(true, |db| db.trans_locks.check(mode, [key]))
    }

    // --- watched keys ---------------------------------------------------

    pub fn register_watched_key(
        &mut self,
        db_index: DbIndex,
        key: &[u8],
        marker: Arc<WatchMarker>,
    ) {
        self.activate_db(db_index);
        let db = self.db_mut(db_index).expect("activated");
        db.watched_keys
            .entry(Bytes::copy_from_slice(key))
            .or_default()
            .push(marker);
    }

    /// Remove one connection's watches, identified by marker pointers.
    pub fn unregister_watched_keys(&mut self, db_index: DbIndex, marker: &Arc<WatchMarker>) {
        let Some(db) = self.db_mut(db_index) else {
            return;
        };
        db.watched_keys.retain(|_, watchers| {
            watchers.retain(|w| !Arc::ptr_eq(w, marker));
            !watchers.is_empty()
        });
    }

    pub fn invalidate_db_watches(&mut self, db_index: DbIndex) {
        let Some(db) = self.db(db_index) else {
            return;
        };
        for watchers in db.watched_keys.values() {
            for w in watchers {
                w.mark_dirty();
            }
        }
    }

    pub fn invalidate_slot_watches(&mut self, slots: &SlotSet) {
        let Some(db) = self.db(0) else {
            return;
        };
        for (key, watchers) in db.watched_keys.iter() {
            if !slots.contains(key_slot(key)) {
                continue;
            }
            for w in watchers {
                w.mark_dirty();
            }
        }
    }

    // --- client tracking ------------------------------------------------

    /// Remember that `client_id` wants invalidation messages for `keys`.
    pub fn track_keys<'k>(&mut self, client_id: u64, keys: impl IntoIterator<Item = &'k [u8]>) {
        for key in keys {
            self.client_tracking
                .entry(Bytes::copy_from_slice(key))
                .or_default()
                .insert(client_id);
        }
    }

    fn send_tracking_invalidation(&mut self, key: &[u8]) {
        let Some(clients) = self.client_tracking.remove(key) else {
            return;
        };
        if let Some(notifier) = &self.tracking_notifier {
            for client in clients {
                notifier(client, key);
            }
        }
    }

    /// Command boundary: clear the per-command bump set.
    pub fn on_cb_finish(&mut self) {
        self.bumped_items.clear();
    }
}

impl std::fmt::Debug for DbSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSlice")
            .field("shard_id", &self.shard_id)
            .field("caching_mode", &self.caching_mode)
            .field("memory_budget", &self.memory_budget)
            .field("databases", &self.db_arr.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn slice() -> DbSlice {
        DbSlice::new(0, &EngineConfig::new(1))
    }

    fn ctx(now: u64) -> DbContext {
        DbContext::new(0, now)
    }

    fn put(slice: &mut DbSlice, key: &[u8], value: &str, expire_at: u64) {
        let res = slice
            .add_or_update(&ctx(0), key, PrimeValue::from_str(value.to_string()), expire_at)
            .unwrap();
        res.updater.run(slice);
    }

    #[test]
    fn test_add_then_find_roundtrip() {
        let mut s = slice();
        put(&mut s, b"a", "1", 0);

        let res = s.find_read_only(&ctx(0), b"a").unwrap();
        let db = s.db(0).unwrap();
        assert_eq!(
            db.prime.value_at(res.pos).unwrap().as_str().unwrap().as_ref(),
            b"1"
        );
        assert_eq!(s.events().hits, 1);
        assert_eq!(s.db_size(0), 1);
    }

    #[test]
    fn test_miss_counts() {
        let mut s = slice();
        assert_eq!(
            s.find_read_only(&ctx(0), b"nope").unwrap_err(),
            OpError::KeyNotFound
        );
        assert_eq!(s.events().misses, 1);
        assert_eq!(s.events().hits, 0);
    }

    #[test]
    fn test_wrong_type_is_not_a_miss() {
        let mut s = slice();
        put(&mut s, b"str", "v", 0);
        let err = s
            .find_read_only_typed(&ctx(0), b"str", ObjType::Hash)
            .unwrap_err();
        assert_eq!(err, OpError::WrongType);
        assert_eq!(s.events().misses, 0);
    }

    #[test]
    fn test_lazy_expiry_deletes_and_journals() {
        let mut s = slice();
        let journal = Journal::with_retention();
        s.set_journal(journal.clone());

        put(&mut s, b"a", "1", 10);
        assert_eq!(
            s.find_read_only(&ctx(20), b"a").unwrap_err(),
            OpError::KeyNotFound
        );
        assert_eq!(s.events().expired_keys, 1);
        assert_eq!(s.db_size(0), 0);

        let entries = journal.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cmd, "DEL");
        assert_eq!(entries[0].args[0].as_ref(), b"a");

        // Expire entry is gone too: the invariant holds.
        assert!(s.db(0).unwrap().expire.is_empty());
    }

    #[test]
    fn test_deadline_equal_to_now_expires() {
        let mut s = slice();
        put(&mut s, b"a", "1", 100);
        assert!(s.find_read_only(&ctx(100), b"a").is_err());
    }

    #[test]
    fn test_expire_bit_tracks_expire_table() {
        let mut s = slice();
        put(&mut s, b"a", "1", 1_000);
        {
            let db = s.db(0).unwrap();
            let pos = db.prime.find(b"a").unwrap();
            assert!(db.prime.value_at(pos).unwrap().has_expire());
            assert_eq!(db.expire.len(), 1);
        }

        let found = s.find_read_only(&ctx(0), b"a").unwrap();
        assert!(found.exp.is_some());
        s.remove_expire(0, found.pos);
        let db = s.db(0).unwrap();
        assert!(!db.prime.value_at(found.pos).unwrap().has_expire());
        assert!(db.expire.is_empty());
    }

    #[test]
    fn test_update_expire_persist() {
        let mut s = slice();
        put(&mut s, b"a", "1", 1_000);
        let found = s.find_read_only(&ctx(0), b"a").unwrap();
        let params = ExpireParams {
            value: 0,
            unit: TimeUnit::Sec,
            absolute: false,
            flags: ExpireFlags::default(),
            persist: true,
        };
        assert_eq!(s.update_expire(&ctx(0), found.pos, found.exp, &params), Ok(0));
        // Never expires afterwards.
        assert!(s.find_read_only(&ctx(u64::MAX / 2), b"a").is_ok());
    }

    #[test]
    fn test_update_expire_flag_conflicts() {
        let mut s = slice();
        put(&mut s, b"a", "1", 10_000);
        let found = s.find_read_only(&ctx(0), b"a").unwrap();

        let mut params = ExpireParams {
            value: 50,
            unit: TimeUnit::Sec,
            absolute: false,
            flags: ExpireFlags {
                nx: true,
                ..Default::default()
            },
            persist: false,
        };
        assert_eq!(
            s.update_expire(&ctx(0), found.pos, found.exp, &params),
            Err(OpError::Skipped)
        );

        params.flags = ExpireFlags {
            gt: true,
            ..Default::default()
        };
        // Current deadline 10s, new 50s: GT allows.
        assert_eq!(
            s.update_expire(&ctx(0), found.pos, found.exp, &params),
            Ok(50_000)
        );

        params.flags = ExpireFlags {
            lt: true,
            ..Default::default()
        };
        // Current deadline 50s, new 50s: LT refuses ties.
        assert_eq!(
            s.update_expire(&ctx(0), found.pos, found.exp, &params),
            Err(OpError::Skipped)
        );
    }

    #[test]
    fn test_update_expire_past_deadline_deletes() {
        let mut s = slice();
        put(&mut s, b"a", "1", 0);
        let found = s.find_read_only(&ctx(1_000), b"a").unwrap();
        let params = ExpireParams {
            value: -5,
            unit: TimeUnit::Sec,
            absolute: false,
            flags: ExpireFlags::default(),
            persist: false,
        };
        assert_eq!(s.update_expire(&ctx(1_000), found.pos, found.exp, &params), Ok(-1));
        assert_eq!(s.db_size(0), 0);
    }

    #[test]
    fn test_update_expire_out_of_range() {
        let mut s = slice();
        put(&mut s, b"a", "1", 0);
        let found = s.find_read_only(&ctx(0), b"a").unwrap();
        let params = ExpireParams {
            value: (MAX_EXPIRE_DEADLINE_SEC + 10) as i64,
            unit: TimeUnit::Sec,
            absolute: false,
            flags: ExpireFlags::default(),
            persist: false,
        };
        assert_eq!(
            s.update_expire(&ctx(0), found.pos, found.exp, &params),
            Err(OpError::OutOfRange)
        );
    }

    #[test]
    fn test_del_idempotent_for_absent_key() {
        let mut s = slice();
        put(&mut s, b"a", "1", 0);
        let pos = s.db(0).unwrap().prime.find(b"a").unwrap();
        assert!(s.del(0, pos));
        assert!(!s.del(0, pos));
        assert_eq!(s.db_size(0), 0);
    }

    #[test]
    fn test_heap_accounting_roundtrip() {
        let mut s = slice();
        put(&mut s, b"k", "some-payload", 0);
        let used = s.db(0).unwrap().stats.obj_memory_usage;
        assert!(used > 0);

        let pos = s.db(0).unwrap().prime.find(b"k").unwrap();
        s.del(0, pos);
        assert_eq!(s.db(0).unwrap().stats.obj_memory_usage, 0);
    }

    #[test]
    fn test_updater_applies_heap_delta() {
        let mut s = slice();
        put(&mut s, b"k", "aa", 0);
        let before = s.db(0).unwrap().stats.obj_memory_usage;

        let found = s.find_mutable(&ctx(0), b"k").unwrap();
        *s.db_mut(0)
            .unwrap()
            .prime
            .value_mut_at(found.pos)
            .unwrap() = PrimeValue::from_str("a-much-longer-payload");
        found.updater.run(&mut s);

        let after = s.db(0).unwrap().stats.obj_memory_usage;
        assert!(after > before);
        assert_eq!(s.events().updates, 2);
    }

    #[test]
    #[should_panic(expected = "post-update guard dropped")]
    fn test_updater_drop_without_run_panics() {
        let mut s = slice();
        put(&mut s, b"k", "v", 0);
        let found = s.find_mutable(&ctx(0), b"k").unwrap();
        drop(found.updater);
    }

    #[test]
    #[should_panic(expected = "post-update ran after")]
    fn test_updater_after_deletion_panics() {
        let mut s = slice();
        put(&mut s, b"k", "v", 0);
        put(&mut s, b"other", "v", 0);
        let found = s.find_mutable(&ctx(0), b"k").unwrap();
        let other = s.db(0).unwrap().prime.find(b"other").unwrap();
        s.del(0, other);
        found.updater.run(&mut s);
    }

    #[test]
    fn test_insert_rejected_when_budget_zero() {
        let config = EngineConfig::new(1).with_max_memory(0);
        let mut s = DbSlice::new(0, &config);
        let err = s.add_or_find(&ctx(0), b"k").unwrap_err();
        assert_eq!(err, OpError::OutOfMemory);
        assert_eq!(s.events().insertion_rejections, 1);
    }

    #[test]
    fn test_loading_bypasses_budget() {
        let config = EngineConfig::new(1).with_max_memory(0);
        let mut s = DbSlice::new(0, &config);
        s.set_loading(true);
        let res = s.add_or_find(&ctx(0), b"k").unwrap();
        assert!(res.is_new);
        res.updater.run(&mut s);
    }

    #[test]
    fn test_bump_once_per_command() {
        let config = EngineConfig::new(1).with_cache_mode(true);
        let mut s = DbSlice::new(0, &config);
        put(&mut s, b"x", "v", 0);

        for _ in 0..10 {
            s.find_read_only(&ctx(0), b"x").unwrap();
        }
        assert_eq!(s.events().bumpups, 1);

        // A new command boundary allows one more bump.
        s.on_cb_finish();
        s.find_read_only(&ctx(0), b"x").unwrap();
        assert_eq!(s.events().bumpups, 2);
    }

    #[test]
    fn test_change_callback_new_key_notice() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut s = slice();
        let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        s.register_on_change(Box::new(move |_, notice, _| {
            if let ChangeNotice::NewKey { key } = notice {
                sink.borrow_mut().push(key.to_vec());
            }
        }));

        put(&mut s, b"fresh", "v", 0);
        assert_eq!(seen.borrow().as_slice(), &[b"fresh".to_vec()]);
    }

    #[test]
    fn test_mutation_notice_precedes_version_stamp() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut s = slice();
        put(&mut s, b"k", "v", 0);

        let observed: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = observed.clone();
        let version = s.register_on_change(Box::new(move |_, notice, db| {
            if let ChangeNotice::Mutation { pos } = notice {
                sink.borrow_mut().push(db.prime.bucket_version(*pos));
            }
        }));

        let found = s.find_mutable(&ctx(0), b"k").unwrap();
        found.updater.run(&mut s);

        let seen = observed.borrow();
        assert_eq!(seen.len(), 1);
        // The bucket was stale (below our registration version) at notice
        // time and is stamped past it afterwards.
        assert!(seen[0] < version);
        let db = s.db(0).unwrap();
        let pos = db.prime.find(b"k").unwrap();
        assert!(db.prime.bucket_version(pos) > version);
    }

    #[test]
    fn test_flush_slots_empty_is_noop() {
        let config = EngineConfig::new(1).with_cluster_mode(ClusterMode::Enabled);
        let mut s = DbSlice::new(0, &config);
        put(&mut s, b"a", "1", 0);
        s.flush_slots_sync(SlotSet::new());
        assert_eq!(s.db_size(0), 1);
    }

    #[test]
    fn test_flush_slots_removes_only_matching() {
        let config = EngineConfig::new(1).with_cluster_mode(ClusterMode::Enabled);
        let mut s = DbSlice::new(0, &config);

        let mut in_slot = Vec::new();
        let mut out_of_slot = Vec::new();
        let target = key_slot(b"anchor");
        for i in 0..500 {
            let key = format!("key:{i}");
            if key_slot(key.as_bytes()) == target {
                in_slot.push(key.clone());
            } else {
                out_of_slot.push(key.clone());
            }
            put(&mut s, key.as_bytes(), "v", 0);
        }

        let slots: SlotSet = [target].into_iter().collect();
        s.flush_slots_sync(slots);

        for key in &in_slot {
            assert!(s.db(0).unwrap().prime.find(key.as_bytes()).is_none());
        }
        for key in &out_of_slot {
            assert!(s.db(0).unwrap().prime.find(key.as_bytes()).is_some());
        }
        assert_eq!(s.db_size(0), out_of_slot.len());
    }

    #[test]
    fn test_slot_stats_key_count_invariant() {
        let config = EngineConfig::new(1).with_cluster_mode(ClusterMode::Enabled);
        let mut s = DbSlice::new(0, &config);
        for i in 0..200 {
            put(&mut s, format!("k{i}").as_bytes(), "v", 0);
        }
        let db = s.db(0).unwrap();
        let total: u64 = db.slots_stats.iter().map(|st| st.key_count).sum();
        assert_eq!(total, db.prime.len() as u64);
    }

    #[test]
    fn test_flush_db_preserves_locks() {
        let mut s = slice();
        put(&mut s, b"a", "1", 0);
        s.acquire_locks(0, crate::db::locks::LockMode::Exclusive, [b"a".as_slice()]);

        s.flush_db(0);
        assert_eq!(s.db_size(0), 0);
        assert!(s.db(0).unwrap().trans_locks.is_locked(b"a"));
    }

    #[test]
    fn test_delete_expired_step() {
        let mut s = slice();
        for i in 0..100 {
            put(&mut s, format!("k{i}").as_bytes(), "v", 50);
        }
        let stats = s.delete_expired_step(&ctx(100), 200);
        assert!(stats.deleted > 0);
        assert_eq!(s.db_size(0), 100 - stats.deleted as usize);
    }

    #[test]
    fn test_watched_key_marked_dirty_on_update() {
        let mut s = slice();
        put(&mut s, b"w", "1", 0);
        let marker = Arc::new(WatchMarker::default());
        s.register_watched_key(0, b"w", marker.clone());

        put(&mut s, b"w", "2", 0);
        assert!(marker.is_dirty());
        // The watch is consumed by the first mutation.
        assert!(s.db(0).unwrap().watched_keys.is_empty());
    }

    #[test]
    fn test_client_tracking_invalidation_on_delete() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut s = slice();
        put(&mut s, b"t", "v", 0);
        let seen: Rc<RefCell<Vec<(u64, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        s.set_tracking_notifier(Box::new(move |client, key| {
            sink.borrow_mut().push((client, key.to_vec()));
        }));
        s.track_keys(7, [b"t".as_slice()]);

        let pos = s.db(0).unwrap().prime.find(b"t").unwrap();
        s.del(0, pos);
        assert_eq!(seen.borrow().as_slice(), &[(7, b"t".to_vec())]);
    }

    #[test]
    fn test_sticky_keys_survive_heartbeat_eviction() {
        let config = EngineConfig::new(1).with_cache_mode(true);
        let mut s = DbSlice::new(0, &config);

        for i in 0..500 {
            let key = format!("k{i}");
            put(&mut s, key.as_bytes(), "v", 0);
            if i % 2 == 0 {
                let pos = s.db(0).unwrap().prime.find(key.as_bytes()).unwrap();
                s.db_mut(0)
                    .unwrap()
                    .prime
                    .key_mut_at(pos)
                    .unwrap()
                    .set_sticky(true);
            }
        }

        s.free_mem_with_eviction_step(0, usize::MAX);
        assert!(s.events().evicted_keys > 0);
        for i in (0..500).step_by(2) {
            assert!(
                s.db(0).unwrap().prime.find(format!("k{i}").as_bytes()).is_some(),
                "sticky key k{i} evicted"
            );
        }
    }

    #[test]
    fn test_mc_flags_follow_entry() {
        let mut s = slice();
        put(&mut s, b"m", "v", 0);
        let pos = s.db(0).unwrap().prime.find(b"m").unwrap();

        assert_eq!(s.get_mc_flag(0, pos), 0);
        s.set_mc_flag(0, pos, 0xBEEF);
        assert_eq!(s.get_mc_flag(0, pos), 0xBEEF);
        assert_eq!(s.db(0).unwrap().mcflag.len(), 1);

        // Deleting the key drops the parallel flag entry.
        s.del(0, pos);
        assert!(s.db(0).unwrap().mcflag.is_empty());
    }

    #[test]
    fn test_fetch_materializes_external_value() {
        use crate::tiered::stub::StubTiered;

        let mut s = slice();
        let tiered = Arc::new(StubTiered::default());
        tiered.stash(4096, PrimeValue::from_str("disk-body"));
        s.set_tiered_storage(tiered.clone());

        let res = s
            .add_or_update(
                &ctx(0),
                b"cold",
                PrimeValue::from_external(4096, 100, ObjType::String),
                0,
            )
            .unwrap();
        res.updater.run(&mut s);
        assert_eq!(s.db(0).unwrap().stats.tiered_entries, 1);

        // A plain read leaves the body on disk.
        let found = s.find_read_only(&ctx(0), b"cold").unwrap();
        assert!(s.db(0).unwrap().prime.value_at(found.pos).unwrap().is_external());

        // A fetching read loads and swaps it in; the position is re-derived
        // from the key afterwards.
        let pos = s
            .find_and_fetch_read_only(&ctx(0), b"cold", ObjType::String)
            .unwrap();
        let db = s.db(0).unwrap();
        let value = db.prime.value_at(pos).unwrap();
        assert!(!value.is_external());
        assert_eq!(value.as_str().unwrap().as_ref(), b"disk-body");
        assert_eq!(db.stats.tiered_entries, 0);
        assert_eq!(tiered.loads.lock().as_slice(), &[b"cold".to_vec()]);
    }

    #[test]
    fn test_fetch_cancels_pending_io() {
        use crate::tiered::stub::StubTiered;

        let mut s = slice();
        let tiered = Arc::new(StubTiered::default());
        s.set_tiered_storage(tiered.clone());

        let res = s
            .add_or_update(&ctx(0), b"warm", PrimeValue::from_str("v"), 0)
            .unwrap();
        let pos = res.pos;
        res.updater.run(&mut s);
        s.db_mut(0)
            .unwrap()
            .prime
            .value_mut_at(pos)
            .unwrap()
            .set_io_pending(true);

        s.find_and_fetch_read_only(&ctx(0), b"warm", ObjType::String)
            .unwrap();
        assert_eq!(tiered.cancels.lock().as_slice(), &[b"warm".to_vec()]);
        let db = s.db(0).unwrap();
        assert!(!db.prime.value_at(pos).unwrap().has_io_pending());
    }

    #[test]
    fn test_doc_deletion_hook_fires_for_hash() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut s = slice();
        let res = s
            .add_or_update(
                &ctx(0),
                b"h",
                PrimeValue::from_hash(
                    [(Bytes::from("f"), Bytes::from("v"))].into_iter().collect(),
                ),
                0,
            )
            .unwrap();
        res.updater.run(&mut s);

        let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        s.set_doc_deletion_callback(Box::new(move |key, _, _| {
            sink.borrow_mut().push(key.to_vec());
        }));

        let pos = s.db(0).unwrap().prime.find(b"h").unwrap();
        s.del(0, pos);
        assert_eq!(seen.borrow().as_slice(), &[b"h".to_vec()]);
    }
}
