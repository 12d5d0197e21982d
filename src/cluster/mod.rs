//! Slot-based cluster partitioning: config snapshots, the administrative
//! command surface, and the slot-migration engine.

pub mod config;
pub mod family;
pub mod migration;
pub mod slot;
pub mod streamer;

pub use config::{
    deleted_slots, is_migration_finalization, publish_tl_config, set_migration_finalization,
    tl_config, ClusterConfig, ClusterShardInfo, Node,
};
pub use family::{CapturingSink, ClusterFamily, Reply, ReplySink};
pub use migration::{
    apply_stream_record, stop_parked_flows, IncomingSlotMigration, MigrationInfo, MigrationState,
    OutgoingMigration, SliceSlotMigration,
};
pub use slot::{key_slot, SlotId, SlotRange, SlotSet, MAX_SLOT, SLOT_COUNT};
pub use streamer::{
    BufferSink, MigrationSink, RestoreRecord, RestoreStreamer, StreamRecord, StreamerStatus,
};
