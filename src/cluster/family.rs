//! Administrative cluster command surface.
//!
//! Handlers receive already-tokenized arguments and write results into an
//! abstract reply sink; wire formatting and connection handling live
//! outside the engine. The config-install path is the interesting one: it
//! detects which in-flight outgoing migration a config diff completes,
//! quiesces in-flight commands under a deadline, publishes the new snapshot
//! on every shard thread, and flushes the slots that moved away.

use crate::cluster::config::{
    deleted_slots, publish_tl_config, set_migration_finalization, ClusterConfig, Node,
};
use crate::cluster::migration::{
    park_flow, IncomingSlotMigration, MigrationState, OutgoingMigration,
};
use crate::cluster::slot::{key_slot, SlotId, SlotRange, SlotSet, MAX_SLOT};
use crate::cluster::streamer::MigrationSink;
use crate::config::{ClusterMode, EngineConfig};
use crate::db::table::SlotStats;
use crate::error::{ClusterError, OpError};
use crate::journal::{Journal, JournalEntry};
use crate::shard::ShardSet;
use crate::types::ShardId;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const CLUSTER_DISABLED: &str =
    "Cluster is disabled. Enable it with cluster mode emulated or enabled";
const CLUSTER_NOT_CONFIGURED: &str = "Cluster is not yet configured";
const SYNC_ID_NOT_FOUND: &str = "syncid not found";

/// Abstract reply builder; the wire protocol is a collaborator concern.
pub trait ReplySink {
    fn start_array(&mut self, len: usize);
    fn send_simple(&mut self, msg: &str);
    fn send_bulk(&mut self, data: &[u8]);
    fn send_long(&mut self, v: i64);
    fn send_error(&mut self, msg: &str);

    fn send_ok(&mut self) {
        self.send_simple("OK");
    }

    fn send_simple_str_arr(&mut self, items: &[&str]) {
        self.start_array(items.len());
        for item in items {
            self.send_simple(item);
        }
    }
}

/// A reply captured for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Array(usize),
    Simple(String),
    Bulk(Vec<u8>),
    Long(i64),
    Error(String),
}

/// Sink collecting replies in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct CapturingSink {
    pub replies: Vec<Reply>,
}

impl ReplySink for CapturingSink {
    fn start_array(&mut self, len: usize) {
        self.replies.push(Reply::Array(len));
    }

    fn send_simple(&mut self, msg: &str) {
        self.replies.push(Reply::Simple(msg.to_string()));
    }

    fn send_bulk(&mut self, data: &[u8]) {
        self.replies.push(Reply::Bulk(data.to_vec()));
    }

    fn send_long(&mut self, v: i64) {
        self.replies.push(Reply::Long(v));
    }

    fn send_error(&mut self, msg: &str) {
        self.replies.push(Reply::Error(msg.to_string()));
    }
}

#[derive(Default)]
struct MigrationRegistry {
    incoming: Vec<Arc<IncomingSlotMigration>>,
    outgoing: HashMap<u32, Arc<OutgoingMigration>>,
    next_sync_id: u32,
}

/// The cluster command family of one node.
pub struct ClusterFamily {
    mode: ClusterMode,
    my_id: String,
    announce_ip: String,
    port: u16,
    quiesce_timeout: Duration,
    shard_set: Arc<ShardSet>,
    journal: Option<Arc<Journal>>,
    current_config: RwLock<Option<Arc<ClusterConfig>>>,
    /// Serializes config installs; two concurrent ones must not interleave.
    set_config_mu: Mutex<()>,
    migrations: Mutex<MigrationRegistry>,
}

impl ClusterFamily {
    pub fn new(
        config: &EngineConfig,
        shard_set: Arc<ShardSet>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        // A 40-character node id, like the wire protocol expects.
        let mut my_id = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        my_id.truncate(40);

        Self {
            mode: config.cluster_mode,
            my_id,
            announce_ip: config.cluster_announce_ip.clone(),
            port: config.port,
            quiesce_timeout: config.config_change_quiesce_timeout,
            shard_set,
            journal,
            current_config: RwLock::new(None),
            set_config_mu: Mutex::new(()),
            migrations: Mutex::new(MigrationRegistry::default()),
        }
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    pub fn current_config(&self) -> Option<Arc<ClusterConfig>> {
        self.current_config.read().clone()
    }

    fn emulated_config(&self) -> Arc<ClusterConfig> {
        let ip = if self.announce_ip.is_empty() {
            "127.0.0.1"
        } else {
            &self.announce_ip
        };
        ClusterConfig::emulated(&self.my_id, ip, self.port, vec![])
    }

    /// The snapshot read commands render: emulated synthesizes one, real
    /// mode requires an installed config.
    fn reading_config(&self) -> Result<Arc<ClusterConfig>, &'static str> {
        match self.mode {
            ClusterMode::Disabled => Err(CLUSTER_DISABLED),
            ClusterMode::Emulated => Ok(self.emulated_config()),
            ClusterMode::Enabled => self
                .current_config()
                .ok_or(CLUSTER_NOT_CONFIGURED),
        }
    }

    // --- CLUSTER -------------------------------------------------------

    /// `CLUSTER <subcommand> ...`
    pub fn cluster(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if self.mode == ClusterMode::Disabled {
            return sink.send_error(CLUSTER_DISABLED);
        }
        let Some(sub) = args.first().map(|s| upper(s)) else {
            return sink.send_error("syntax error");
        };
        match sub.as_str() {
            "HELP" => self.cluster_help(sink),
            "SHARDS" => self.cluster_shards(sink),
            "SLOTS" => self.cluster_slots(sink),
            "NODES" => self.cluster_nodes(sink),
            "INFO" => self.cluster_info(sink),
            "KEYSLOT" => self.key_slot_cmd(args, sink),
            _ => sink.send_error(&format!("Unknown CLUSTER subcommand: {sub}")),
        }
    }

    fn cluster_help(&self, sink: &mut dyn ReplySink) {
        sink.send_simple_str_arr(&[
            "CLUSTER <subcommand> [<arg> [value] [opt] ...]. Subcommands are:",
            "SLOTS",
            "   Return information about slots range mappings. Each range is made of:",
            "   start, end, master and replicas IP addresses, ports and ids.",
            "NODES",
            "   Return cluster configuration seen by node. Output format:",
            "   <id> <ip:port> <flags> <master> <pings> <pongs> <epoch> <link> <slot> ...",
            "INFO",
            "  Return information about the cluster",
            "HELP",
            "    Prints this help.",
        ]);
    }

    fn cluster_shards(&self, sink: &mut dyn ReplySink) {
        let config = match self.reading_config() {
            Ok(c) => c,
            Err(e) => return sink.send_error(e),
        };

        let write_node = |sink: &mut dyn ReplySink, node: &Node, role: &str| {
            sink.start_array(14);
            sink.send_bulk(b"id");
            sink.send_bulk(node.id.as_bytes());
            sink.send_bulk(b"endpoint");
            sink.send_bulk(node.ip.as_bytes());
            sink.send_bulk(b"ip");
            sink.send_bulk(node.ip.as_bytes());
            sink.send_bulk(b"port");
            sink.send_long(node.port as i64);
            sink.send_bulk(b"role");
            sink.send_bulk(role.as_bytes());
            sink.send_bulk(b"replication-offset");
            sink.send_long(0);
            sink.send_bulk(b"health");
            sink.send_bulk(b"online");
        };

        let shards = config.get_config();
        sink.start_array(shards.len());
        for shard in shards {
            sink.start_array(4);
            sink.send_bulk(b"slots");
            sink.start_array(shard.slot_ranges.len() * 2);
            for range in &shard.slot_ranges {
                sink.send_long(range.start as i64);
                sink.send_long(range.end as i64);
            }
            sink.send_bulk(b"nodes");
            sink.start_array(1 + shard.replicas.len());
            write_node(sink, &shard.master, "master");
            for replica in &shard.replicas {
                write_node(sink, replica, "replica");
            }
        }
    }

    fn cluster_slots(&self, sink: &mut dyn ReplySink) {
        let config = match self.reading_config() {
            Ok(c) => c,
            Err(e) => return sink.send_error(e),
        };

        let write_node = |sink: &mut dyn ReplySink, node: &Node| {
            sink.start_array(3);
            sink.send_bulk(node.ip.as_bytes());
            sink.send_long(node.port as i64);
            sink.send_bulk(node.id.as_bytes());
        };

        let shards = config.get_config();
        let ranges: usize = shards.iter().map(|s| s.slot_ranges.len()).sum();
        sink.start_array(ranges);
        for shard in shards {
            for range in &shard.slot_ranges {
                sink.start_array(3 + shard.replicas.len());
                sink.send_long(range.start as i64);
                sink.send_long(range.end as i64);
                write_node(sink, &shard.master);
                for replica in &shard.replicas {
                    write_node(sink, replica);
                }
            }
        }
    }

    fn cluster_nodes(&self, sink: &mut dyn ReplySink) {
        let config = match self.reading_config() {
            Ok(c) => c,
            Err(e) => return sink.send_error(e),
        };

        let mut out = String::new();
        let write_node =
            |out: &mut String, node: &Node, role: &str, master_id: &str, ranges: &[SlotRange]| {
                out.push_str(&node.id);
                out.push(' ');
                out.push_str(&format!("{}:{}@{} ", node.ip, node.port, node.port));
                if node.id == self.my_id {
                    out.push_str("myself,");
                }
                out.push_str(role);
                out.push(' ');
                out.push_str(master_id);
                out.push_str(" 0 0 0 connected");
                for range in ranges {
                    if range.start == range.end {
                        out.push_str(&format!(" {}", range.start));
                    } else {
                        out.push_str(&format!(" {}-{}", range.start, range.end));
                    }
                }
                out.push_str("\r\n");
            };

        for shard in config.get_config() {
            write_node(&mut out, &shard.master, "master", "-", &shard.slot_ranges);
            for replica in &shard.replicas {
                // Only masters print ranges.
                write_node(&mut out, replica, "slave", &shard.master.id, &[]);
            }
        }
        sink.send_bulk(out.as_bytes());
    }

    fn cluster_info(&self, sink: &mut dyn ReplySink) {
        let config = self.reading_config().ok();

        let (state, slots_assigned, known_nodes, cluster_size) = match &config {
            None => ("fail", 0usize, 0usize, 0usize),
            Some(c) => {
                let shards = c.get_config();
                let known = shards.iter().map(|s| 1 + s.replicas.len()).sum();
                let size = shards.iter().filter(|s| !s.slot_ranges.is_empty()).count();
                ("ok", MAX_SLOT as usize + 1, known, size)
            }
        };

        let mut out = String::new();
        let mut append = |k: &str, v: String| {
            out.push_str(k);
            out.push(':');
            out.push_str(&v);
            out.push_str("\r\n");
        };
        append("cluster_state", state.to_string());
        append("cluster_slots_assigned", slots_assigned.to_string());
        append("cluster_slots_ok", slots_assigned.to_string());
        append("cluster_slots_pfail", "0".into());
        append("cluster_slots_fail", "0".into());
        append("cluster_known_nodes", known_nodes.to_string());
        append("cluster_size", cluster_size.to_string());
        append("cluster_current_epoch", "1".into());
        append("cluster_my_epoch", "1".into());
        append("cluster_stats_messages_ping_sent", "1".into());
        append("cluster_stats_messages_pong_sent", "1".into());
        append("cluster_stats_messages_sent", "1".into());
        append("cluster_stats_messages_ping_received", "1".into());
        append("cluster_stats_messages_pong_received", "1".into());
        append("cluster_stats_messages_meet_received", "0".into());
        append("cluster_stats_messages_received", "1".into());
        sink.send_bulk(out.as_bytes());
    }

    fn key_slot_cmd(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if args.len() != 2 {
            return sink.send_error("wrong number of arguments for 'cluster keyslot' command");
        }
        sink.send_long(key_slot(&args[1]) as i64);
    }

    /// `READONLY`: a no-op acknowledgment, emulated mode only.
    pub fn read_only(&self, sink: &mut dyn ReplySink) {
        if self.mode != ClusterMode::Emulated {
            return sink.send_error(CLUSTER_DISABLED);
        }
        sink.send_ok();
    }

    /// `READWRITE`: a no-op acknowledgment, emulated mode only.
    pub fn read_write(&self, sink: &mut dyn ReplySink) {
        if self.mode != ClusterMode::Emulated {
            return sink.send_error(CLUSTER_DISABLED);
        }
        sink.send_ok();
    }

    // --- DFLYCLUSTER ---------------------------------------------------

    /// `DFLYCLUSTER <subcommand> ...` (admin surface).
    pub fn dfly_cluster(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if self.mode == ClusterMode::Disabled {
            return sink.send_error(CLUSTER_DISABLED);
        }
        let Some(sub) = args.first().map(|s| upper(s)) else {
            return sink.send_error("syntax error");
        };
        let rest = &args[1..];
        match sub.as_str() {
            "MYID" => self.dfly_cluster_my_id(rest, sink),
            "CONFIG" => self.dfly_cluster_config(rest, sink),
            "GETSLOTINFO" => self.dfly_cluster_get_slot_info(rest, sink),
            "FLUSHSLOTS" => self.dfly_cluster_flush_slots(rest, sink),
            "START-SLOT-MIGRATION" => self.dfly_cluster_start_slot_migration(rest, sink),
            "SLOT-MIGRATION-STATUS" => self.dfly_slot_migration_status(rest, sink),
            _ => sink.send_error(&format!("Unknown DFLYCLUSTER subcommand: {sub}")),
        }
    }

    fn dfly_cluster_my_id(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if !args.is_empty() {
            return sink.send_error("wrong number of arguments for 'dflycluster myid' command");
        }
        sink.send_bulk(self.my_id.as_bytes());
    }

    /// Install a new cluster config. See the module docs for the protocol.
    pub fn dfly_cluster_config(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if args.len() != 1 {
            return sink.send_error("wrong number of arguments for 'dflycluster config' command");
        }
        let Ok(json) = std::str::from_utf8(&args[0]) else {
            return sink.send_error("Invalid JSON cluster config");
        };
        let new_config = match ClusterConfig::from_config_json(&self.my_id, json) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "can't set cluster config");
                return sink.send_error("Invalid cluster configuration.");
            }
        };

        let _guard = self.set_config_mu.lock();

        self.detect_migration_finalization(&new_config);

        let (is_first, before) = match self.current_config() {
            Some(old) => (false, old.owned_slots()),
            None => (true, SlotSet::new()),
        };

        // Unblock commands whose keys are about to become foreign.
        let filter_config = new_config.clone();
        self.shard_set
            .blocking_controller()
            .cancel_matching(move |keys| {
                keys.iter().find_map(|key| {
                    let slot = key_slot(key);
                    if filter_config.is_my_slot(slot) {
                        return None;
                    }
                    let owner = filter_config.slot_owner(slot);
                    Some(OpError::KeyMoved {
                        slot,
                        host: owner.map(|n| n.ip.clone()).unwrap_or_default(),
                        port: owner.map(|n| n.port).unwrap_or_default(),
                    })
                })
            });

        // Publish the snapshot on every shard thread, then wait for the
        // commands that saw the old config to drain.
        let published = new_config.clone();
        self.shard_set
            .await_on_all(move |_| publish_tl_config(Some(published.clone())));
        publish_tl_config(Some(new_config.clone()));

        let tracker = self.shard_set.track_on_all();
        if !tracker.wait(self.quiesce_timeout) {
            warn!("cluster config change timed out");
        }

        *self.current_config.write() = Some(new_config.clone());
        info!(shards = new_config.get_config().len(), "cluster config installed");

        // This node acts as master for its slots; drop the ones that left.
        let after = new_config.owned_slots();
        let deleted = deleted_slots(is_first, &before, &after);
        self.delete_slots_and_journal(&deleted);

        sink.send_ok();
    }

    /// The weak containment check: the first in-flight outgoing migration
    /// whose whole slot set is inside the config diff is considered
    /// completed by it.
    fn detect_migration_finalization(&self, new_config: &Arc<ClusterConfig>) {
        let registry = self.migrations.lock();
        if registry.outgoing.is_empty() {
            return;
        }
        let Some(old) = self.current_config() else {
            return;
        };
        let deleted = deleted_slots(false, &old.owned_slots(), &new_config.owned_slots());
        if deleted.is_empty() {
            return;
        }
        for migration in registry.outgoing.values() {
            if deleted.contains_all(&migration.slot_set()) {
                info!(peer = %migration.info().host, "config change finalizes migration");
                self.shard_set
                    .await_on_all(|_| set_migration_finalization(true));
                set_migration_finalization(true);
                old.set_migrated_slots(deleted);
                break;
            }
        }
    }

    fn delete_slots_and_journal(&self, deleted: &SlotSet) {
        if deleted.is_empty() {
            return;
        }
        self.shard_set.flush_slots(deleted.clone());

        if let Some(journal) = &self.journal {
            let mut args = Vec::with_capacity(deleted.len() + 1);
            args.push(Bytes::from_static(b"FLUSHSLOTS"));
            for slot in deleted.iter() {
                args.push(Bytes::from(slot.to_string()));
            }
            journal.record(JournalEntry::command(
                "DFLYCLUSTER",
                args,
                self.shard_set.size(),
            ));
        }
    }

    fn dfly_cluster_get_slot_info(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        if args.first().map(|a| upper(a)) != Some("SLOTS".to_string()) || args.len() < 2 {
            return sink.send_error("syntax error");
        }

        let mut slots: Vec<SlotId> = Vec::with_capacity(args.len() - 1);
        for arg in &args[1..] {
            match parse_slot(arg) {
                Some(slot) => slots.push(slot),
                None => return sink.send_error("Invalid slot id"),
            }
        }

        let mut totals: Vec<(SlotId, SlotStats)> =
            slots.iter().map(|&s| (s, SlotStats::default())).collect();
        for shard in 0..self.shard_set.size() {
            let slots = slots.clone();
            let partial = self.shard_set.await_on(shard as ShardId, move |slice| {
                slots
                    .iter()
                    .map(|&sid| slice.get_slot_stats(sid))
                    .collect::<Vec<_>>()
            });
            for (total, part) in totals.iter_mut().zip(partial) {
                total.1 += part;
            }
        }

        sink.start_array(totals.len());
        for (slot, stats) in totals {
            sink.start_array(9);
            sink.send_long(slot as i64);
            sink.send_bulk(b"key_count");
            sink.send_long(stats.key_count as i64);
            sink.send_bulk(b"total_reads");
            sink.send_long(stats.total_reads as i64);
            sink.send_bulk(b"total_writes");
            sink.send_long(stats.total_writes as i64);
            sink.send_bulk(b"memory_bytes");
            sink.send_long(stats.memory_bytes as i64);
        }
    }

    fn dfly_cluster_flush_slots(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        let mut slots = SlotSet::new();
        if args.is_empty() {
            return sink.send_error("syntax error");
        }
        for arg in args {
            match parse_slot(arg) {
                Some(slot) => {
                    slots.insert(slot);
                }
                None => return sink.send_error("syntax error"),
            }
        }
        self.delete_slots_and_journal(&slots);
        sink.send_ok();
    }

    fn dfly_cluster_start_slot_migration(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        let parsed = parse_host_port_ranges(args);
        let Some((host, port, ranges)) = parsed else {
            return sink.send_error("syntax error");
        };
        match self.start_slot_migration(host, port, ranges) {
            Ok(_) => sink.send_ok(),
            Err(e) => sink.send_error(&e.to_string()),
        }
    }

    /// Begin an incoming migration from `host:port` for `ranges`.
    pub fn start_slot_migration(
        &self,
        host: String,
        port: u16,
        ranges: Vec<SlotRange>,
    ) -> Result<Arc<IncomingSlotMigration>, ClusterError> {
        let mut registry = self.migrations.lock();
        for migration in &registry.incoming {
            let info = migration.info();
            if info.host == host && info.port == port {
                return Err(ClusterError::MigrationExists { host, port });
            }
        }
        let migration = Arc::new(IncomingSlotMigration::new(
            host,
            port,
            ranges,
            self.shard_set.size(),
        ));
        registry.incoming.push(migration.clone());
        Ok(migration)
    }

    fn dfly_slot_migration_status(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        let registry = self.migrations.lock();

        if !args.is_empty() {
            let Some((host, port, _)) = parse_host_port_ranges_opt(args) else {
                return sink.send_error("syntax error");
            };
            for migration in &registry.incoming {
                let info = migration.info();
                if info.host == host && info.port == port {
                    return sink.send_simple(&migration.state().to_string());
                }
            }
            for migration in registry.outgoing.values() {
                let info = migration.info();
                if info.host == host && info.port == port {
                    return sink.send_simple(&migration.state().to_string());
                }
            }
        } else {
            let total = registry.incoming.len() + registry.outgoing.len();
            if total != 0 {
                sink.start_array(total);
                for migration in &registry.incoming {
                    let info = migration.info();
                    sink.send_simple(&format!(
                        "in {}:{} {}",
                        info.host,
                        info.port,
                        migration.state()
                    ));
                }
                for migration in registry.outgoing.values() {
                    let info = migration.info();
                    sink.send_simple(&format!(
                        "out {}:{} {}",
                        info.host,
                        info.port,
                        migration.state()
                    ));
                }
                return;
            }
        }
        sink.send_simple(&MigrationState::NoState.to_string());
    }

    // --- DFLYMIGRATE ---------------------------------------------------

    /// `DFLYMIGRATE CONF port s1 e1 ...`: allocate a sync id for an
    /// outgoing migration towards `remote_host`.
    pub fn migration_conf(
        &self,
        remote_host: String,
        port: u16,
        ranges: Vec<SlotRange>,
    ) -> Result<(u32, u32), ClusterError> {
        let Some(config) = self.current_config() else {
            return Err(ClusterError::NotConfigured);
        };
        for range in &ranges {
            for slot in range.start..=range.end {
                if !config.is_my_slot(slot) {
                    warn!(slot, "invalid migration slot");
                    return Err(ClusterError::InvalidSlotRange);
                }
            }
        }

        let mut registry = self.migrations.lock();
        registry.next_sync_id += 1;
        let sync_id = registry.next_sync_id;
        let migration = Arc::new(OutgoingMigration::new(
            self.shard_set.size(),
            remote_host,
            port,
            ranges,
        ));
        registry.outgoing.insert(sync_id, migration);
        info!(sync_id, "outgoing migration registered");
        Ok((sync_id, self.shard_set.size()))
    }

    /// `DFLYMIGRATE FLOW sync_id shard_id`: bind this connection's sink to
    /// the shard and start streaming.
    pub fn migration_flow(
        &self,
        sync_id: u32,
        shard_id: ShardId,
        sink: Arc<dyn MigrationSink>,
    ) -> Result<(), ClusterError> {
        let migration = {
            let registry = self.migrations.lock();
            registry
                .outgoing
                .get(&sync_id)
                .cloned()
                .ok_or(ClusterError::SyncIdNotFound(sync_id))?
        };

        let shard_tx = self.shard_set.task_sender(shard_id);
        self.shard_set.await_on(shard_id, move |slice| {
            let flow = migration.start_flow(slice, sink, shard_tx);
            park_flow(flow);
        });
        Ok(())
    }

    /// `DFLYMIGRATE FULL-SYNC-CUT sync_id shard_id`: the incoming side
    /// marks a flow's snapshot finished.
    pub fn full_sync_cut(&self, sync_id: u32, shard_id: ShardId) -> Result<(), ClusterError> {
        let registry = self.migrations.lock();
        let migration = registry
            .incoming
            .iter()
            .find(|m| m.sync_id() == Some(sync_id))
            .ok_or(ClusterError::SyncIdNotFound(sync_id))?;
        migration.set_stable_sync_for_flow(shard_id);
        if migration.state() == MigrationState::StableSync {
            info!(sync_id, "STABLE-SYNC state reached");
        }
        Ok(())
    }

    /// `DFLYMIGRATE <subcommand> ...` for the sub-commands that do not
    /// need a data sink.
    pub fn dfly_migrate(&self, args: &[Bytes], sink: &mut dyn ReplySink) {
        let Some(sub) = args.first().map(|s| upper(s)) else {
            return sink.send_error("syntax error");
        };
        let rest = &args[1..];
        match sub.as_str() {
            "CONF" => {
                // The caller's address is the destination host; handlers
                // embedded without a connection pass it explicitly.
                let Some((port, ranges)) = parse_port_ranges(rest) else {
                    return sink.send_error("syntax error");
                };
                match self.migration_conf("127.0.0.1".to_string(), port, ranges) {
                    Ok((sync_id, shards)) => {
                        sink.start_array(2);
                        sink.send_long(sync_id as i64);
                        sink.send_long(shards as i64);
                    }
                    Err(ClusterError::NotConfigured) => sink.send_error(CLUSTER_NOT_CONFIGURED),
                    Err(e) => sink.send_error(&e.to_string()),
                }
            }
            "FULL-SYNC-CUT" => {
                let (Some(sync_id), Some(shard_id)) =
                    (rest.first().and_then(parse_u32), rest.get(1).and_then(parse_u32))
                else {
                    return sink.send_error("syntax error");
                };
                match self.full_sync_cut(sync_id, shard_id) {
                    Ok(()) => sink.send_ok(),
                    Err(_) => sink.send_error(SYNC_ID_NOT_FOUND),
                }
            }
            _ => sink.send_error(&format!("Unknown DFLYMIGRATE subcommand: {sub}")),
        }
    }
}

fn upper(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).to_uppercase()
}

fn parse_u32(arg: &Bytes) -> Option<u32> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_slot(arg: &Bytes) -> Option<SlotId> {
    let v: u32 = std::str::from_utf8(arg).ok()?.parse().ok()?;
    (v <= MAX_SLOT as u32).then_some(v as SlotId)
}

fn parse_ranges(args: &[Bytes]) -> Option<Vec<SlotRange>> {
    if args.is_empty() || args.len() % 2 != 0 {
        return None;
    }
    let mut ranges = Vec::with_capacity(args.len() / 2);
    for pair in args.chunks(2) {
        let start = parse_slot(&pair[0])?;
        let end = parse_slot(&pair[1])?;
        let range = SlotRange::new(start, end);
        if !range.is_valid() {
            return None;
        }
        ranges.push(range);
    }
    Some(ranges)
}

fn parse_port_ranges(args: &[Bytes]) -> Option<(u16, Vec<SlotRange>)> {
    let port: u16 = std::str::from_utf8(args.first()?).ok()?.parse().ok()?;
    Some((port, parse_ranges(&args[1..])?))
}

fn parse_host_port_ranges(args: &[Bytes]) -> Option<(String, u16, Vec<SlotRange>)> {
    let host = std::str::from_utf8(args.first()?).ok()?.to_string();
    let (port, ranges) = parse_port_ranges(&args[1..])?;
    Some((host, port, ranges))
}

fn parse_host_port_ranges_opt(args: &[Bytes]) -> Option<(String, u16, Vec<SlotRange>)> {
    let host = std::str::from_utf8(args.first()?).ok()?.to_string();
    let port: u16 = std::str::from_utf8(args.get(1)?).ok()?.parse().ok()?;
    Some((host, port, Vec::new()))
}
