//! Slot-migration state machines.
//!
//! A migration moves a set of slot ranges from a source node (*outgoing*)
//! to a destination node (*incoming*). Each side tracks one flow per shard;
//! a flow walks `NO_STATE -> CONNECTING -> FULL_SYNC -> STABLE_SYNC`, and a
//! migration's aggregate state is the minimum over its flows.

use crate::cluster::slot::{SlotRange, SlotSet};
use crate::cluster::streamer::{MigrationSink, RestoreStreamer, StreamRecord};
use crate::db::slice::DbSlice;
use crate::shard::ShardTask;
use crate::types::{DbContext, ShardId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

/// State of one migration flow (or of a whole migration: min over flows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MigrationState {
    NoState = 0,
    Connecting = 1,
    FullSync = 2,
    StableSync = 3,
}

impl MigrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MigrationState::Connecting,
            2 => MigrationState::FullSync,
            3 => MigrationState::StableSync,
            _ => MigrationState::NoState,
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::NoState => "NO_STATE",
            MigrationState::Connecting => "CONNECTING",
            MigrationState::FullSync => "FULL_SYNC",
            MigrationState::StableSync => "STABLE_SYNC",
        };
        f.write_str(s)
    }
}

/// Endpoint of the peer node of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    pub host: String,
    pub port: u16,
}

/// Cross-thread state of one outgoing flow.
#[derive(Debug)]
pub struct FlowStatus {
    state: AtomicU8,
    streamer: Arc<crate::cluster::streamer::StreamerStatus>,
}

impl FlowStatus {
    /// The flow's effective state: full sync is promoted to stable sync
    /// once the streamer reports the snapshot drained.
    pub fn state(&self) -> MigrationState {
        let state = MigrationState::from_u8(self.state.load(Ordering::Acquire));
        if state == MigrationState::FullSync && self.streamer.is_snapshot_finished() {
            MigrationState::StableSync
        } else {
            state
        }
    }
}

/// Per-shard driver of one outgoing migration. Lives on the shard thread.
pub struct SliceSlotMigration {
    streamer: RestoreStreamer,
    status: Arc<FlowStatus>,
}

impl SliceSlotMigration {
    fn start(
        slice: &mut DbSlice,
        slots: SlotSet,
        sink: Arc<dyn MigrationSink>,
        shard_tx: UnboundedSender<ShardTask>,
    ) -> Self {
        let streamer = RestoreStreamer::start(slice, slots, sink, shard_tx);
        let status = Arc::new(FlowStatus {
            state: AtomicU8::new(MigrationState::FullSync as u8),
            streamer: streamer.status(),
        });
        Self { streamer, status }
    }

    pub fn stop(&mut self, slice: &mut DbSlice) {
        self.streamer.stop(slice);
        self.status
            .state
            .store(MigrationState::NoState as u8, Ordering::Release);
    }
}

/// Source side of a migration: one flow per shard, registered as they
/// connect.
pub struct OutgoingMigration {
    id: Uuid,
    info: MigrationInfo,
    slots: Vec<SlotRange>,
    flows: Mutex<Vec<Option<Arc<FlowStatus>>>>,
}

impl OutgoingMigration {
    pub fn new(flows_num: u32, host: impl Into<String>, port: u16, slots: Vec<SlotRange>) -> Self {
        Self {
            id: Uuid::new_v4(),
            info: MigrationInfo {
                host: host.into(),
                port,
            },
            slots,
            flows: Mutex::new((0..flows_num).map(|_| None).collect()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn info(&self) -> &MigrationInfo {
        &self.info
    }

    pub fn slot_ranges(&self) -> &[SlotRange] {
        &self.slots
    }

    pub fn slot_set(&self) -> SlotSet {
        SlotSet::from_ranges(&self.slots)
    }

    /// Start this shard's flow. Runs on the shard thread; the returned
    /// driver stays there while the shared status is registered here.
    pub fn start_flow(
        &self,
        slice: &mut DbSlice,
        sink: Arc<dyn MigrationSink>,
        shard_tx: UnboundedSender<ShardTask>,
    ) -> SliceSlotMigration {
        let flow = SliceSlotMigration::start(slice, self.slot_set(), sink, shard_tx);
        let shard_id = slice.shard_id() as usize;
        let mut flows = self.flows.lock();
        if flows[shard_id].is_some() {
            warn!(shard_id, "restarting an already-started migration flow");
        }
        flows[shard_id] = Some(flow.status.clone());
        info!(
            shard_id,
            peer = %self.info.host,
            port = self.info.port,
            "outgoing migration flow started"
        );
        flow
    }

    /// Aggregate state: the minimum over all started flows.
    pub fn state(&self) -> MigrationState {
        let flows = self.flows.lock();
        let mut min_state = MigrationState::StableSync;
        for flow in flows.iter().flatten() {
            min_state = min_state.min(flow.state());
        }
        min_state
    }
}

/// Destination side of a migration.
pub struct IncomingSlotMigration {
    info: MigrationInfo,
    slots: Vec<SlotRange>,
    sync_id: Mutex<Option<u32>>,
    state: AtomicU8,
    flow_cut: Mutex<Vec<bool>>,
}

impl IncomingSlotMigration {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        slots: Vec<SlotRange>,
        shard_count: u32,
    ) -> Self {
        Self {
            info: MigrationInfo {
                host: host.into(),
                port,
            },
            slots,
            sync_id: Mutex::new(None),
            state: AtomicU8::new(MigrationState::Connecting as u8),
            flow_cut: Mutex::new(vec![false; shard_count as usize]),
        }
    }

    pub fn info(&self) -> &MigrationInfo {
        &self.info
    }

    pub fn slot_ranges(&self) -> &[SlotRange] {
        &self.slots
    }

    pub fn sync_id(&self) -> Option<u32> {
        *self.sync_id.lock()
    }

    /// Record the sync id returned by the source's CONF reply; the flows
    /// are now streaming.
    pub fn set_sync_id(&self, sync_id: u32) {
        *self.sync_id.lock() = Some(sync_id);
        self.state
            .store(MigrationState::FullSync as u8, Ordering::Release);
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark one flow's snapshot finished. When every flow is cut, the
    /// incoming side reaches stable sync.
    pub fn set_stable_sync_for_flow(&self, shard_id: ShardId) {
        let mut cut = self.flow_cut.lock();
        if let Some(flag) = cut.get_mut(shard_id as usize) {
            *flag = true;
        }
        if cut.iter().all(|&c| c) {
            self.state
                .store(MigrationState::StableSync as u8, Ordering::Release);
            info!(
                peer = %self.info.host,
                port = self.info.port,
                "incoming migration reached stable sync"
            );
        }
    }
}

thread_local! {
    /// Flow drivers are `!Send`; they are parked on their shard thread and
    /// live until the migration is stopped there.
    static TL_FLOWS: std::cell::RefCell<Vec<SliceSlotMigration>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

/// Keep a started flow alive on the current shard thread.
pub(crate) fn park_flow(flow: SliceSlotMigration) {
    TL_FLOWS.with(|flows| flows.borrow_mut().push(flow));
}

/// Stop and drop every flow parked on the current shard thread.
pub fn stop_parked_flows(slice: &mut DbSlice) {
    TL_FLOWS.with(|flows| {
        for mut flow in flows.borrow_mut().drain(..) {
            flow.stop(slice);
        }
    });
}

/// Apply one stream record on the destination slice. Restore records upsert
/// the key; journal DELs remove it.
pub fn apply_stream_record(slice: &mut DbSlice, record: StreamRecord, now_ms: u64) {
    match record {
        StreamRecord::Restore(rec) => {
            let cntx = DbContext::new(rec.db_index, now_ms);
            // Restoration must not be rejected by conservative growth
            // estimates; it mirrors the snapshot-load path.
            slice.set_loading(true);
            let res = slice.add_or_update(&cntx, &rec.key, rec.value, rec.expire_at_ms);
            slice.set_loading(false);
            match res {
                Ok(res) => res.updater.run(slice),
                Err(e) => warn!(error = %e, "failed to apply restore record"),
            }
        }
        StreamRecord::Journal(entry) => {
            if entry.cmd == "DEL" {
                for key in &entry.args {
                    let cntx = DbContext::new(entry.db_index, now_ms);
                    let pos = slice.db(cntx.db_index).and_then(|db| db.prime.find(key));
                    if let Some(pos) = pos {
                        slice.del(cntx.db_index, pos);
                    }
                }
            } else if entry.cmd == "SET" && entry.args.len() >= 2 {
                let cntx = DbContext::new(entry.db_index, now_ms);
                let value = crate::table::PrimeValue::from_str(entry.args[1].clone());
                match slice.add_or_update(&cntx, &entry.args[0], value, 0) {
                    Ok(res) => res.updater.run(slice),
                    Err(e) => warn!(error = %e, "failed to apply journal write"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering_matches_progression() {
        assert!(MigrationState::NoState < MigrationState::Connecting);
        assert!(MigrationState::Connecting < MigrationState::FullSync);
        assert!(MigrationState::FullSync < MigrationState::StableSync);
        assert_eq!(MigrationState::StableSync.to_string(), "STABLE_SYNC");
    }

    #[test]
    fn test_incoming_cut_per_flow() {
        let incoming = IncomingSlotMigration::new("src", 7000, vec![SlotRange::new(0, 10)], 2);
        assert_eq!(incoming.state(), MigrationState::Connecting);

        incoming.set_sync_id(1);
        assert_eq!(incoming.state(), MigrationState::FullSync);

        incoming.set_stable_sync_for_flow(0);
        assert_eq!(incoming.state(), MigrationState::FullSync);
        incoming.set_stable_sync_for_flow(1);
        assert_eq!(incoming.state(), MigrationState::StableSync);
    }

    #[test]
    fn test_outgoing_aggregate_is_min() {
        let outgoing = OutgoingMigration::new(2, "dst", 7001, vec![SlotRange::new(5, 5)]);
        // No flows started: vacuously stable, matching the identity of min.
        assert_eq!(outgoing.state(), MigrationState::StableSync);
        assert_eq!(outgoing.slot_set().len(), 1);
    }
}
