//! The per-shard database layer: slices, tables, locks and eviction.

pub mod eviction;
pub mod locks;
pub mod slice;
pub mod table;
pub mod top_keys;

pub use eviction::{PrimeBumpPolicy, PrimeEvictionPolicy};
pub use locks::{IntentLock, LockMode, LockTable};
pub use slice::{
    AddOrFind, AutoUpdater, ChangeCallback, ChangeNotice, DbSlice, DbStats, DeleteExpiredStats,
    ExpireFlags, ExpireParams, FindResult, MutableFind, SliceEvents, SliceStats, SlotFlushState,
    TimeUnit,
};
pub use table::{DbTable, DbTableStats, SlotStats, WatchMarker};
pub use top_keys::TopKeys;
