//! Integration-test harness and end-to-end scenarios.
//!
//! `TestEngine` assembles the pieces a node runs in production: a shard set
//! with per-shard journals, and the cluster command family on top. Tests
//! drive it from the control thread the way a dispatcher would.

mod cluster_tests;
mod engine_tests;

use crate::cluster::family::ClusterFamily;
use crate::config::EngineConfig;
use crate::db::slice::DbSlice;
use crate::journal::Journal;
use crate::shard::ShardSet;
use crate::table::{dash_hash, PrimeValue};
use crate::types::{DbContext, ShardId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fully assembled single-node engine for tests.
pub struct TestEngine {
    pub shard_set: Arc<ShardSet>,
    pub family: ClusterFamily,
    /// Journal the control plane (config changes, slot flushes) writes to.
    pub control_journal: Arc<Journal>,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        let control_journal = Journal::with_retention();
        let shard_set = Arc::new(ShardSet::new(&config, |slice| {
            // Every shard journals to its own retained log, like a real
            // per-shard journal file.
            slice.set_journal(Journal::with_retention());
        }));
        let family = ClusterFamily::new(&config, shard_set.clone(), Some(control_journal.clone()));
        Self {
            shard_set,
            family,
            control_journal,
        }
    }

    /// The shard a key routes to.
    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        (dash_hash(key) % self.shard_set.size() as u64) as ShardId
    }

    /// Upsert a string value, running the post-update guard.
    pub fn put(&self, key: &[u8], value: &str, expire_at_ms: u64) {
        let key = key.to_vec();
        let value = value.to_string();
        self.shard_set.await_on(self.shard_for(&key), move |slice| {
            let cntx = DbContext::new(0, 0);
            let res = slice
                .add_or_update(&cntx, &key, PrimeValue::from_str(value), expire_at_ms)
                .expect("upsert");
            res.updater.run(slice);
            slice.on_cb_finish();
        });
    }

    /// Read a string value at a given clock.
    pub fn get_at(&self, key: &[u8], now_ms: u64) -> Option<Bytes> {
        let key = key.to_vec();
        self.shard_set.await_on(self.shard_for(&key), move |slice| {
            let cntx = DbContext::new(0, now_ms);
            let res = slice.find_read_only(&cntx, &key).ok()?;
            let out = slice
                .db(0)
                .and_then(|db| db.prime.value_at(res.pos))
                .and_then(|v| v.as_str())
                .cloned();
            slice.on_cb_finish();
            out
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_at(key, 0)
    }

    /// Total keys across all shards.
    pub fn total_keys(&self) -> usize {
        let mut total = 0;
        for shard in 0..self.shard_set.size() {
            total += self.shard_set.await_on(shard as ShardId, |slice| slice.db_size(0));
        }
        total
    }

    /// All keys of one shard, sorted, for exact set comparisons.
    pub fn keys_of_shard(&self, shard: ShardId) -> Vec<Vec<u8>> {
        self.shard_set.await_on(shard, |slice| {
            let mut keys: Vec<Vec<u8>> = slice
                .db(0)
                .map(|db| {
                    db.prime
                        .iter()
                        .map(|(_, k, _)| k.as_bytes().to_vec())
                        .collect()
                })
                .unwrap_or_default();
            keys.sort();
            keys
        })
    }

    /// The per-shard journal installed at worker startup.
    pub fn shard_journal(&self, shard: ShardId) -> Arc<Journal> {
        self.shard_set
            .await_on(shard, |slice| slice.journal_handle().expect("journal wired"))
    }

    /// Run a closure against one shard's slice and wait.
    pub fn on_shard<R: Send + 'static>(
        &self,
        shard: ShardId,
        f: impl FnOnce(&mut DbSlice) -> R + Send + 'static,
    ) -> R {
        self.shard_set.await_on(shard, f)
    }
}

/// Opt-in test logging: `RUST_LOG=shoal=debug cargo test -- --nocapture`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Poll until `pred` holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Keys that all land in one slot (and therefore one shard-independent
/// slot), via the hash-tag rule.
pub fn tagged_keys(tag: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{{{tag}}}:k{i}").into_bytes())
        .collect()
}

/// A config document where `me` owns everything.
pub fn full_config_json(me: &str) -> String {
    serde_json::json!([
        {
            "slot_ranges": [{"start": 0, "end": crate::cluster::slot::MAX_SLOT}],
            "master": {"id": me, "ip": "127.0.0.1", "port": 7000},
            "replicas": []
        }
    ])
    .to_string()
}

/// A config document where `slot` belongs to `peer` and `me` owns the rest.
pub fn split_config_json(me: &str, peer: &str, slot: u16) -> String {
    let max = crate::cluster::slot::MAX_SLOT;
    let mut my_ranges = Vec::new();
    if slot > 0 {
        my_ranges.push(serde_json::json!({"start": 0, "end": slot - 1}));
    }
    if slot < max {
        my_ranges.push(serde_json::json!({"start": slot + 1, "end": max}));
    }
    serde_json::json!([
        {
            "slot_ranges": my_ranges,
            "master": {"id": me, "ip": "127.0.0.1", "port": 7000},
            "replicas": []
        },
        {
            "slot_ranges": [{"start": slot, "end": slot}],
            "master": {"id": peer, "ip": "10.0.0.9", "port": 7001},
            "replicas": []
        }
    ])
    .to_string()
}

/// Install a config document, asserting success.
pub fn install_config(engine: &TestEngine, json: &str) {
    use crate::cluster::family::{CapturingSink, Reply};
    let mut sink = CapturingSink::default();
    engine.family.dfly_cluster(
        &[Bytes::from("CONFIG"), Bytes::from(json.to_string())],
        &mut sink,
    );
    assert_eq!(sink.replies[0], Reply::Simple("OK".into()), "config install");
}
