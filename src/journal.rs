//! The ordered log of applied mutations.
//!
//! The slice writes entries here after applying them; replication followers
//! and stable-sync migration streamers consume them through subscriptions.
//! Persistence is a collaborator concern; this module only defines the entry
//! shapes and the in-process fan-out.

use crate::cluster::slot::SlotId;
use crate::types::DbIndex;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// A key removed by lazy expiry or eviction; payload is a DEL.
    Expired,
    /// A value write, replicated verbatim.
    Set,
    /// An administrative command, e.g. FLUSHSLOTS.
    Command,
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub txid: u64,
    pub op: JournalOp,
    pub db_index: DbIndex,
    pub shard_count: u32,
    /// Slot of the affected key, when cluster mode is on.
    pub slot: Option<SlotId>,
    /// Command name, e.g. "DEL" or "DFLYCLUSTER".
    pub cmd: String,
    pub args: Vec<Bytes>,
}

impl JournalEntry {
    /// A lazy-expiry / eviction deletion.
    pub fn expired(db_index: DbIndex, slot: Option<SlotId>, key: &[u8]) -> Self {
        Self {
            txid: 0,
            op: JournalOp::Expired,
            db_index,
            shard_count: 1,
            slot,
            cmd: "DEL".to_string(),
            args: vec![Bytes::copy_from_slice(key)],
        }
    }

    /// A value write.
    pub fn set(db_index: DbIndex, slot: Option<SlotId>, key: &[u8], payload: Bytes) -> Self {
        Self {
            txid: 0,
            op: JournalOp::Set,
            db_index,
            shard_count: 1,
            slot,
            cmd: "SET".to_string(),
            args: vec![Bytes::copy_from_slice(key), payload],
        }
    }

    /// An administrative command entry.
    pub fn command(cmd: impl Into<String>, args: Vec<Bytes>, shard_count: u32) -> Self {
        Self {
            txid: 0,
            op: JournalOp::Command,
            db_index: 0,
            shard_count,
            slot: None,
            cmd: cmd.into(),
            args,
        }
    }
}

type Subscriber = Box<dyn Fn(&JournalEntry) + Send + Sync>;

/// In-process journal: records entries in order and fans them out to
/// subscribers. Retention of recorded entries is opt-in (tests, streamers
/// that attach late do not replay).
pub struct Journal {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_sub_id: AtomicU64,
    retained: Option<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            retained: None,
        })
    }

    /// A journal that keeps every entry, for inspection in tests.
    pub fn with_retention() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            retained: Some(Mutex::new(Vec::new())),
        })
    }

    /// Append an entry and notify subscribers, in order.
    pub fn record(&self, entry: JournalEntry) {
        if let Some(retained) = &self.retained {
            retained.lock().push(entry.clone());
        }
        let subs = self.subscribers.lock();
        for (_, cb) in subs.iter() {
            cb(&entry);
        }
    }

    /// Register a subscriber; returns an id for unsubscribing.
    pub fn subscribe(&self, cb: Subscriber) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, cb));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    /// Retained entries, when retention is on.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.retained
            .as_ref()
            .map(|r| r.lock().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_and_order() {
        let journal = Journal::with_retention();
        journal.record(JournalEntry::expired(0, Some(7), b"a"));
        journal.record(JournalEntry::command(
            "DFLYCLUSTER",
            vec![Bytes::from("FLUSHSLOTS"), Bytes::from("7")],
            2,
        ));

        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, JournalOp::Expired);
        assert_eq!(entries[0].cmd, "DEL");
        assert_eq!(entries[1].op, JournalOp::Command);
    }

    #[test]
    fn test_subscription_fanout() {
        let journal = Journal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = journal.subscribe(Box::new(move |e| sink.lock().push(e.cmd.clone())));

        journal.record(JournalEntry::expired(0, None, b"x"));
        assert_eq!(seen.lock().as_slice(), &["DEL".to_string()]);

        journal.unsubscribe(id);
        journal.record(JournalEntry::expired(0, None, b"y"));
        assert_eq!(seen.lock().len(), 1);
    }
}
