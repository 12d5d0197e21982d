//! Shard workers and cross-shard coordination.
//!
//! Each shard is one dedicated OS thread owning its `DbSlice`. Work arrives
//! as closures over a channel and runs to completion one at a time; that
//! exclusivity is the engine's whole concurrency story for the data path.
//! Long traversals yield cooperatively by re-enqueueing a continuation, so
//! queued commands interleave at bucket granularity instead of stalling.

use crate::config::EngineConfig;
use crate::db::slice::DbSlice;
use crate::error::OpError;
use crate::types::ShardId;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A unit of work executed on a shard thread with exclusive slice access.
pub type ShardTask = Box<dyn FnOnce(&mut DbSlice) + Send>;

/// Buckets processed per scheduling quantum of a chunked traversal.
pub const TRAVERSE_CHUNK_BUCKETS: usize = 100;

struct ShardHandle {
    tx: Option<UnboundedSender<ShardTask>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// The set of shard workers of one node.
pub struct ShardSet {
    shards: Vec<ShardHandle>,
    blocking: Arc<BlockingController>,
}

impl ShardSet {
    /// Spawn one worker per shard. `setup` runs on each worker thread
    /// against the freshly built slice (journal wiring, tiered storage).
    pub fn new(config: &EngineConfig, setup: impl Fn(&mut DbSlice) + Send + Sync + 'static) -> Self {
        let setup = Arc::new(setup);
        let mut shards = Vec::with_capacity(config.shard_count as usize);

        for shard_id in 0..config.shard_count {
            let (tx, mut rx) = unbounded_channel::<ShardTask>();
            let config = config.clone();
            let setup = setup.clone();

            let thread = thread::Builder::new()
                .name(format!("shard-{shard_id}"))
                .spawn(move || {
                    let mut slice = DbSlice::new(shard_id as ShardId, &config);
                    setup(&mut slice);
                    debug!(shard_id, "shard worker started");
                    while let Some(task) = rx.blocking_recv() {
                        task(&mut slice);
                    }
                    debug!(shard_id, "shard worker stopped");
                })
                .expect("spawn shard worker");

            shards.push(ShardHandle {
                tx: Some(tx),
                thread: Some(thread),
            });
        }

        info!(shards = shards.len(), "shard set started");
        Self {
            shards,
            blocking: Arc::new(BlockingController::default()),
        }
    }

    pub fn size(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn blocking_controller(&self) -> &Arc<BlockingController> {
        &self.blocking
    }

    fn sender(&self, shard: ShardId) -> &UnboundedSender<ShardTask> {
        self.shards[shard as usize]
            .tx
            .as_ref()
            .expect("shard set live")
    }

    /// Sender for self-enqueued continuations (chunked traversals,
    /// snapshot streaming).
    pub(crate) fn task_sender(&self, shard: ShardId) -> UnboundedSender<ShardTask> {
        self.sender(shard).clone()
    }

    /// Enqueue work on one shard without waiting for it.
    pub fn dispatch(&self, shard: ShardId, f: impl FnOnce(&mut DbSlice) + Send + 'static) {
        let _ = self.sender(shard).send(Box::new(f));
    }

    /// Run `f` on one shard and wait for its result.
    ///
    /// Must be called from a control-plane thread; calling it from a shard
    /// worker against itself would deadlock.
    pub fn await_on<R: Send + 'static>(
        &self,
        shard: ShardId,
        f: impl FnOnce(&mut DbSlice) -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, move |slice| {
            let _ = tx.send(f(slice));
        });
        rx.blocking_recv().expect("shard worker alive")
    }

    /// Run `f` on every shard and wait for all of them. Ordering across
    /// shards is unspecified; each shard runs its callback atomically with
    /// respect to that shard's other operations.
    pub fn await_on_all(&self, f: impl Fn(&mut DbSlice) + Send + Sync + 'static) {
        let f = Arc::new(f);
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in 0..self.size() {
            let f = f.clone();
            let (tx, rx) = oneshot::channel();
            self.dispatch(shard as ShardId, move |slice| {
                f(slice);
                let _ = tx.send(());
            });
            acks.push(rx);
        }
        for ack in acks {
            let _ = ack.blocking_recv();
        }
    }

    /// Flush the given slots on every shard, asynchronously, yielding every
    /// `TRAVERSE_CHUNK_BUCKETS` buckets.
    pub fn flush_slots(&self, slots: crate::cluster::slot::SlotSet) {
        if slots.is_empty() {
            return;
        }
        for shard in 0..self.size() {
            let tx = self.sender(shard as ShardId).clone();
            let slots = slots.clone();
            self.dispatch(shard as ShardId, move |slice| {
                let state = slice.begin_flush_slots(slots);
                resume_flush(tx, state)(slice);
            });
        }
    }

    /// Enqueue a marker on every shard; the returned tracker completes when
    /// every task queued before it has drained.
    pub fn track_on_all(&self) -> DispatchTracker {
        let tracker = DispatchTracker::new(self.shards.len());
        for shard in 0..self.size() {
            let inner = tracker.inner.clone();
            self.dispatch(shard as ShardId, move |_| {
                inner.complete_one();
            });
        }
        tracker
    }
}

fn resume_flush(
    tx: UnboundedSender<ShardTask>,
    mut state: crate::db::slice::SlotFlushState,
) -> ShardTask {
    Box::new(move |slice| {
        if !slice.run_flush_slots_chunk(&mut state, TRAVERSE_CHUNK_BUCKETS) {
            let next = resume_flush(tx.clone(), state);
            let _ = tx.send(next);
        } else {
            debug!(shard = slice.shard_id(), "slot flush finished");
        }
    })
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        for shard in self.shards.iter_mut() {
            shard.tx.take();
        }
        for shard in self.shards.iter_mut() {
            if let Some(thread) = shard.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct TrackerInner {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl TrackerInner {
    fn complete_one(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }
}

/// Waits for in-flight per-shard work to drain, with a deadline.
pub struct DispatchTracker {
    inner: Arc<TrackerInner>,
}

impl DispatchTracker {
    fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                remaining: Mutex::new(count),
                cond: Condvar::new(),
            }),
        }
    }

    /// True when all shards drained before the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut remaining = self.inner.remaining.lock();
        while *remaining > 0 {
            if self.inner.cond.wait_until(&mut remaining, deadline).timed_out() {
                break;
            }
        }
        let done = *remaining == 0;
        if !done {
            warn!("dispatch tracker timed out");
        }
        done
    }
}

struct BlockedEntry {
    id: u64,
    keys: Vec<Bytes>,
    waker: oneshot::Sender<OpError>,
}

/// Registry of commands blocked on keys, so a cluster-config change can
/// unblock the ones whose keys moved away.
#[derive(Default)]
pub struct BlockingController {
    entries: Mutex<Vec<BlockedEntry>>,
    next_id: Mutex<u64>,
}

impl BlockingController {
    /// Register a command blocked on `keys`. The receiver fires with the
    /// cancellation status if the command is cancelled.
    pub fn register(&self, keys: Vec<Bytes>) -> (u64, oneshot::Receiver<OpError>) {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.entries.lock().push(BlockedEntry {
            id,
            keys,
            waker: tx,
        });
        (id, rx)
    }

    /// Drop a registration after the command unblocked normally.
    pub fn unregister(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Cancel every blocked command for which the filter yields an error.
    pub fn cancel_matching(&self, filter: impl Fn(&[Bytes]) -> Option<OpError>) {
        let mut entries = self.entries.lock();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            match filter(&entry.keys) {
                Some(err) => {
                    let _ = entry.waker.send(err);
                }
                None => kept.push(entry),
            }
        }
        *entries = kept;
    }

    pub fn blocked_count(&self) -> usize {
        self.entries.lock().len()
    }
}
