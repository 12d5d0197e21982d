//! Sharded in-memory key-value engine with slot-based cluster partitioning.
//!
//! Each shard of a node runs on one dedicated worker thread and owns a
//! [`db::DbSlice`]: the single-threaded authority over that shard's key
//! space. The slice mediates every read and write over a pair of segmented
//! hash tables (key to value, key to deadline), runs lazy expiration and
//! memory-pressure eviction inline with those operations, and keeps
//! concurrent observers (snapshotters, migration streamers) consistent via
//! versioned change notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               ClusterFamily                     │
//! │  CLUSTER / DFLYCLUSTER / DFLYMIGRATE handlers   │
//! └─────────────────────────────────────────────────┘
//!            │ config publish / slot flush / flows
//!            ▼
//! ┌─────────────────────────────────────────────────┐
//! │                  ShardSet                       │
//! │   one worker thread per shard, task channels    │
//! └─────────────────────────────────────────────────┘
//!       │               │                │
//!       ▼               ▼                ▼
//!  ┌─────────┐     ┌─────────┐      ┌─────────┐
//!  │ DbSlice │     │ DbSlice │      │ DbSlice │
//!  │ tables  │     │ tables  │      │ tables  │
//!  └─────────┘     └─────────┘      └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use shoal::config::EngineConfig;
//! use shoal::db::DbSlice;
//! use shoal::table::PrimeValue;
//! use shoal::types::DbContext;
//!
//! let mut slice = DbSlice::new(0, &EngineConfig::new(1));
//! let cntx = DbContext::new(0, 0);
//!
//! let res = slice
//!     .add_or_update(&cntx, b"user:1", PrimeValue::from_str("alice"), 0)
//!     .unwrap();
//! res.updater.run(&mut slice);
//!
//! let found = slice.find_read_only(&cntx, b"user:1").unwrap();
//! let db = slice.db(0).unwrap();
//! assert_eq!(
//!     db.prime.value_at(found.pos).unwrap().as_str().unwrap().as_ref(),
//!     b"alice"
//! );
//! ```
//!
//! # Concurrency model
//!
//! There are no locks on the data path. A slice is only ever touched by its
//! shard worker; cross-shard work goes through [`shard::ShardSet`], which
//! runs closures on every worker and waits for them. Long traversals (slot
//! flushes, snapshot streaming) yield cooperatively by re-enqueueing
//! continuations on their own task queue. The few process-wide locks guard
//! control-plane state: the set-config path and the migration registries.

pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod journal;
pub mod shard;
pub mod table;
pub mod tiered;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the types most embedders touch.
pub use cluster::{ClusterConfig, ClusterFamily, MigrationState, SlotId, SlotRange, SlotSet};
pub use config::{ClusterMode, EngineConfig};
pub use db::{DbSlice, SliceEvents};
pub use error::{ClusterError, OpError, OpResult};
pub use journal::{Journal, JournalEntry, JournalOp};
pub use shard::ShardSet;
pub use table::{PrimeKey, PrimeValue};
pub use types::{DbContext, DbIndex, ObjType, ShardId};
