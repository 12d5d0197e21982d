//! Streaming snapshot of a slot set, followed by journal tailing.
//!
//! The streamer drives the full-sync phase of a slot migration. At start it
//! registers as a change observer, capturing an upper version bound: every
//! bucket below the bound is stale and still owed to the sink. The snapshot
//! traversal walks the prime table in chunks, emitting matching entries and
//! stamping each visited bucket past the bound; a mutation that touches a
//! still-stale bucket flushes that bucket to the sink first, through the
//! observer. Journal tailing starts immediately so that once the traversal
//! drains, the sink is already receiving incremental entries.

use crate::cluster::slot::{key_slot, SlotId, SlotSet};
use crate::db::slice::{ChangeNotice, DbSlice};
use crate::db::table::DbTable;
use crate::journal::{Journal, JournalEntry};
use crate::shard::{ShardTask, TRAVERSE_CHUNK_BUCKETS};
use crate::table::{Cursor, Pos, PrimeValue};
use crate::types::DbIndex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// One key in opaque restore form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub db_index: DbIndex,
    pub slot: SlotId,
    pub key: Vec<u8>,
    pub value: PrimeValue,
    /// Absolute deadline in ms; zero when the key does not expire.
    pub expire_at_ms: u64,
}

/// What flows over a migration connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamRecord {
    Restore(RestoreRecord),
    Journal(JournalEntry),
}

impl StreamRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("stream records always serialize")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Destination of a migration stream.
pub trait MigrationSink: Send + Sync {
    fn send(&self, record: StreamRecord);
}

/// Sink collecting records in memory, for tests and loopback wiring.
#[derive(Default)]
pub struct BufferSink {
    records: parking_lot::Mutex<Vec<StreamRecord>>,
}

impl BufferSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<StreamRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl MigrationSink for BufferSink {
    fn send(&self, record: StreamRecord) {
        self.records.lock().push(record);
    }
}

/// Cross-thread view of a streamer's progress.
#[derive(Debug, Default)]
pub struct StreamerStatus {
    snapshot_finished: AtomicBool,
}

impl StreamerStatus {
    pub fn is_snapshot_finished(&self) -> bool {
        self.snapshot_finished.load(Ordering::Acquire)
    }
}

struct StreamerCore {
    slots: SlotSet,
    /// The registration version; set right after registering on the slice.
    /// Shared with tasks on the shard queue, hence atomic.
    upper_bound: AtomicU64,
    expire_base: u64,
    sink: Arc<dyn MigrationSink>,
}

impl StreamerCore {
    fn upper_bound(&self) -> u64 {
        self.upper_bound.load(Ordering::Acquire)
    }

    /// Emit every matching entry of the bucket at `pos` unless the bucket
    /// was already visited, then stamp it visited.
    fn write_bucket(&self, db: &mut DbTable, pos: Pos) {
        let head = pos.bucket_head();
        if db.prime.bucket_version(head) >= self.upper_bound() {
            return;
        }
        for entry_pos in db.prime.bucket_positions(head.segment, head.bucket) {
            let Some((key, value)) = db.prime.pair_at(entry_pos) else {
                continue;
            };
            let slot = key_slot(key.as_bytes());
            if !self.slots.contains(slot) {
                continue;
            }
            let expire_at_ms = if value.has_expire() {
                db.expire
                    .find(key.as_bytes())
                    .and_then(|p| db.expire.value_at(p))
                    .map(|period| self.expire_base + period.duration_ms())
                    .unwrap_or(0)
            } else {
                0
            };
            self.sink.send(StreamRecord::Restore(RestoreRecord {
                db_index: db.index,
                slot,
                key: key.as_bytes().to_vec(),
                value: value.clone(),
                expire_at_ms,
            }));
        }
        // Mark visited against this streamer's bound only; a streamer
        // registered later still owes this bucket to its own sink.
        db.prime.raise_bucket_version(head, self.upper_bound());
    }
}

/// The full-sync streamer of one shard's slice.
pub struct RestoreStreamer {
    status: Arc<StreamerStatus>,
    change_cb_id: u64,
    journal_sub_id: Option<u64>,
    journal: Option<Arc<Journal>>,
}

impl RestoreStreamer {
    /// Register on the slice, subscribe to the journal, and kick off the
    /// chunked snapshot traversal via the shard's task queue.
    pub fn start(
        slice: &mut DbSlice,
        slots: SlotSet,
        sink: Arc<dyn MigrationSink>,
        shard_tx: UnboundedSender<ShardTask>,
    ) -> Self {
        let status = Arc::new(StreamerStatus::default());
        let journal = slice_journal(slice);

        // Tail the journal from the very beginning of the snapshot; entries
        // for migrated slots observed during full sync are forwarded too.
        let journal_sub_id = journal.as_ref().map(|j| {
            let sink = sink.clone();
            let slots = slots.clone();
            j.subscribe(Box::new(move |entry: &JournalEntry| {
                if entry.slot.map_or(false, |s| slots.contains(s)) {
                    sink.send(StreamRecord::Journal(entry.clone()));
                }
            }))
        });

        let core = Arc::new(StreamerCore {
            slots,
            upper_bound: AtomicU64::new(0),
            expire_base: slice.expire_base(),
            sink,
        });

        let cb_core = core.clone();
        let version = slice.register_on_change(Box::new(
            move |_db_index: DbIndex, notice: &ChangeNotice<'_>, db: &mut DbTable| {
                match notice {
                    ChangeNotice::Mutation { pos } => cb_core.write_bucket(db, *pos),
                    ChangeNotice::NewKey { key } => {
                        // Flush every stale bucket the insertion may touch
                        // before iterators into them are invalidated.
                        let hotspot = db.prime.hotspot(key);
                        for bucket in hotspot
                            .regular
                            .iter()
                            .chain(hotspot.stash.iter())
                            .copied()
                        {
                            cb_core.write_bucket(
                                db,
                                Pos {
                                    segment: hotspot.segment,
                                    bucket,
                                    slot: 0,
                                },
                            );
                        }
                    }
                }
            },
        ));
        core.upper_bound.store(version, Ordering::Release);
        info!(upper_bound = version, "restore streamer started");

        let streamer = Self {
            status: status.clone(),
            change_cb_id: version,
            journal_sub_id,
            journal,
        };

        let _ = shard_tx.send(snapshot_chunk(core, status, shard_tx.clone(), Cursor::start()));
        streamer
    }

    pub fn status(&self) -> Arc<StreamerStatus> {
        self.status.clone()
    }

    pub fn is_snapshot_finished(&self) -> bool {
        self.status.is_snapshot_finished()
    }

    /// Unregister from the slice and the journal. Called when the migration
    /// is finalized or aborted.
    pub fn stop(&mut self, slice: &mut DbSlice) {
        slice.unregister_on_change(self.change_cb_id);
        if let (Some(journal), Some(sub)) = (&self.journal, self.journal_sub_id.take()) {
            journal.unsubscribe(sub);
        }
        debug!("restore streamer stopped");
    }
}

fn slice_journal(slice: &DbSlice) -> Option<Arc<Journal>> {
    slice.journal_handle()
}

fn snapshot_chunk(
    core: Arc<StreamerCore>,
    status: Arc<StreamerStatus>,
    shard_tx: UnboundedSender<ShardTask>,
    mut cursor: Cursor,
) -> ShardTask {
    Box::new(move |slice: &mut DbSlice| {
        for _ in 0..TRAVERSE_CHUNK_BUCKETS {
            if cursor.is_done() {
                break;
            }
            let Some(db) = slice.db_mut(0) else { break };
            let (positions, next) = db.prime.scan_bucket(cursor);
            if let Some(&first) = positions.first() {
                core.write_bucket(db, first);
            }
            cursor = next;
        }
        if cursor.is_done() {
            status.snapshot_finished.store(true, Ordering::Release);
            info!(shard = slice.shard_id(), "snapshot traversal finished");
        } else {
            let next = snapshot_chunk(core.clone(), status.clone(), shard_tx.clone(), cursor);
            let _ = shard_tx.send(next);
        }
    })
}
