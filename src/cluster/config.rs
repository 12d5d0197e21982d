//! The authoritative slot-to-owner mapping.
//!
//! A `ClusterConfig` is an immutable snapshot built from a validated config
//! document. Every thread that touches keys holds its own published pointer,
//! swapped under the process-wide set-config lock, so data-path ownership
//! checks never take a lock. The emulated single-node mode flows through the
//! same type with a synthesized full-range config.

use crate::cluster::slot::{SlotId, SlotRange, SlotSet, MAX_SLOT};
use crate::error::ClusterError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::warn;

/// One node of a cluster shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Node {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

/// One shard of the cluster: its slot ranges and node set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterShardInfo {
    pub slot_ranges: Vec<SlotRange>,
    pub master: Node,
    #[serde(default)]
    pub replicas: Vec<Node>,
}

/// Immutable validated snapshot of the cluster topology.
pub struct ClusterConfig {
    my_id: String,
    shards: Vec<ClusterShardInfo>,
    owned_slots: SlotSet,
    /// Slots this node still holds but has migrated away; cleared from
    /// ownership checks ahead of the config that removes them.
    migrated_slots: RwLock<SlotSet>,
}

impl ClusterConfig {
    /// Parse and validate a config document.
    pub fn from_config_json(my_id: &str, json: &str) -> Result<Arc<Self>, ClusterError> {
        let shards: Vec<ClusterShardInfo> = serde_json::from_str(json)?;
        Self::from_shards(my_id, shards)
    }

    /// Validate an already-parsed shard list.
    pub fn from_shards(
        my_id: &str,
        shards: Vec<ClusterShardInfo>,
    ) -> Result<Arc<Self>, ClusterError> {
        let mut covered = SlotSet::new();
        for shard in &shards {
            if shard.master.id.is_empty() {
                return Err(ClusterError::InvalidConfig("empty master id".into()));
            }
            if shard.slot_ranges.is_empty() {
                return Err(ClusterError::InvalidConfig(format!(
                    "shard {} owns no slots",
                    shard.master.id
                )));
            }
            for range in &shard.slot_ranges {
                if !range.is_valid() {
                    return Err(ClusterError::InvalidConfig(format!(
                        "invalid slot range {}-{}",
                        range.start, range.end
                    )));
                }
                for slot in range.start..=range.end {
                    if !covered.insert(slot) {
                        return Err(ClusterError::InvalidConfig(format!(
                            "slot {slot} assigned twice"
                        )));
                    }
                }
            }
        }
        if covered.len() != MAX_SLOT as usize + 1 {
            return Err(ClusterError::InvalidConfig(format!(
                "config covers {} of {} slots",
                covered.len(),
                MAX_SLOT as usize + 1
            )));
        }

        let mut owned = SlotSet::new();
        for shard in &shards {
            let mine = shard.master.id == my_id || shard.replicas.iter().any(|r| r.id == my_id);
            if mine {
                for range in &shard.slot_ranges {
                    for slot in range.start..=range.end {
                        owned.insert(slot);
                    }
                }
            }
        }

        Ok(Arc::new(Self {
            my_id: my_id.to_string(),
            shards,
            owned_slots: owned,
            migrated_slots: RwLock::new(SlotSet::new()),
        }))
    }

    /// The synthetic single-shard config of emulated mode.
    pub fn emulated(my_id: &str, ip: &str, port: u16, replicas: Vec<Node>) -> Arc<Self> {
        let shard = ClusterShardInfo {
            slot_ranges: vec![SlotRange::new(0, MAX_SLOT)],
            master: Node {
                id: my_id.to_string(),
                ip: ip.to_string(),
                port,
            },
            replicas,
        };
        Arc::new(Self {
            my_id: my_id.to_string(),
            shards: vec![shard],
            owned_slots: SlotSet::full(),
            migrated_slots: RwLock::new(SlotSet::new()),
        })
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    pub fn get_config(&self) -> &[ClusterShardInfo] {
        &self.shards
    }

    /// Slots this node currently serves.
    pub fn owned_slots(&self) -> SlotSet {
        let mut owned = self.owned_slots.clone();
        for slot in self.migrated_slots.read().iter() {
            owned.remove(slot);
        }
        owned
    }

    pub fn is_my_slot(&self, slot: SlotId) -> bool {
        self.owned_slots.contains(slot) && !self.migrated_slots.read().contains(slot)
    }

    pub fn is_my_key(&self, key: &[u8]) -> bool {
        self.is_my_slot(crate::cluster::slot::key_slot(key))
    }

    /// Mark slots as migrated away ahead of the config change that removes
    /// them; subsequent ownership checks reject them.
    pub fn set_migrated_slots(&self, slots: SlotSet) {
        *self.migrated_slots.write() = slots;
    }

    /// The master serving a slot, for MOVED redirections.
    pub fn slot_owner(&self, slot: SlotId) -> Option<&Node> {
        self.shards
            .iter()
            .find(|s| s.slot_ranges.iter().any(|r| r.contains(slot)))
            .map(|s| &s.master)
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("my_id", &self.my_id)
            .field("shards", &self.shards.len())
            .field("owned_slots", &self.owned_slots.len())
            .finish()
    }
}

thread_local! {
    static TL_CLUSTER_CONFIG: RefCell<Option<Arc<ClusterConfig>>> = const { RefCell::new(None) };
    static TL_MIGRATION_FINALIZATION: RefCell<bool> = const { RefCell::new(false) };
}

/// The calling thread's published config snapshot.
pub fn tl_config() -> Option<Arc<ClusterConfig>> {
    TL_CLUSTER_CONFIG.with(|c| c.borrow().clone())
}

/// Publish a snapshot on the calling thread. Swapped on every shard thread
/// under the set-config lock.
pub fn publish_tl_config(config: Option<Arc<ClusterConfig>>) {
    TL_CLUSTER_CONFIG.with(|c| *c.borrow_mut() = config);
}

pub fn is_migration_finalization() -> bool {
    TL_MIGRATION_FINALIZATION.with(|f| *f.borrow())
}

pub fn set_migration_finalization(on: bool) {
    if on {
        warn!("entering migration finalization on this thread");
    }
    TL_MIGRATION_FINALIZATION.with(|f| *f.borrow_mut() = on);
}

/// The slots owned before but not after: the set a config change deletes.
pub fn deleted_slots(is_first_config: bool, before: &SlotSet, after: &SlotSet) -> SlotSet {
    let mut result = SlotSet::new();
    for slot in 0..=MAX_SLOT {
        if (before.contains(slot) || is_first_config) && !after.contains(slot) {
            result.insert(slot);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shard_json() -> String {
        serde_json::json!([
            {
                "slot_ranges": [{"start": 0, "end": 8191}],
                "master": {"id": "node-a", "ip": "10.0.0.1", "port": 7001},
                "replicas": []
            },
            {
                "slot_ranges": [{"start": 8192, "end": 16383}],
                "master": {"id": "node-b", "ip": "10.0.0.2", "port": 7002},
                "replicas": [{"id": "node-c", "ip": "10.0.0.3", "port": 7003}]
            }
        ])
        .to_string()
    }

    #[test]
    fn test_parse_and_ownership() {
        let config = ClusterConfig::from_config_json("node-a", &two_shard_json()).unwrap();
        assert!(config.is_my_slot(0));
        assert!(config.is_my_slot(8191));
        assert!(!config.is_my_slot(8192));
        assert_eq!(config.owned_slots().len(), 8192);
        assert_eq!(config.slot_owner(9000).unwrap().id, "node-b");
    }

    #[test]
    fn test_replica_owns_its_shard_slots() {
        let config = ClusterConfig::from_config_json("node-c", &two_shard_json()).unwrap();
        assert!(!config.is_my_slot(0));
        assert!(config.is_my_slot(16000));
    }

    #[test]
    fn test_rejects_partial_coverage() {
        let json = serde_json::json!([
            {
                "slot_ranges": [{"start": 0, "end": 100}],
                "master": {"id": "a", "ip": "x", "port": 1},
                "replicas": []
            }
        ])
        .to_string();
        assert!(ClusterConfig::from_config_json("a", &json).is_err());
    }

    #[test]
    fn test_rejects_overlap() {
        let json = serde_json::json!([
            {
                "slot_ranges": [{"start": 0, "end": 16383}],
                "master": {"id": "a", "ip": "x", "port": 1},
                "replicas": []
            },
            {
                "slot_ranges": [{"start": 5, "end": 5}],
                "master": {"id": "b", "ip": "y", "port": 2},
                "replicas": []
            }
        ])
        .to_string();
        assert!(ClusterConfig::from_config_json("a", &json).is_err());
    }

    #[test]
    fn test_rejects_bad_json() {
        assert!(ClusterConfig::from_config_json("a", "{not json").is_err());
    }

    #[test]
    fn test_migrated_slots_excluded() {
        let config = ClusterConfig::from_config_json("node-a", &two_shard_json()).unwrap();
        assert!(config.is_my_slot(100));
        config.set_migrated_slots([100u16].into_iter().collect());
        assert!(!config.is_my_slot(100));
        assert!(config.is_my_slot(101));
        assert_eq!(config.owned_slots().len(), 8191);
    }

    #[test]
    fn test_emulated_owns_everything() {
        let config = ClusterConfig::emulated("me", "127.0.0.1", 6379, vec![]);
        assert!(config.is_my_slot(0));
        assert!(config.is_my_slot(MAX_SLOT));
        assert_eq!(config.get_config().len(), 1);
    }

    #[test]
    fn test_deleted_slots_diff() {
        let before: SlotSet = [1u16, 2, 3].into_iter().collect();
        let after: SlotSet = [2u16].into_iter().collect();
        let deleted = deleted_slots(false, &before, &after);
        assert!(deleted.contains(1));
        assert!(deleted.contains(3));
        assert!(!deleted.contains(2));

        // The first config deletes everything it does not claim.
        let first = deleted_slots(true, &SlotSet::new(), &after);
        assert_eq!(first.len(), MAX_SLOT as usize);
    }

    #[test]
    fn test_tl_publication() {
        publish_tl_config(None);
        assert!(tl_config().is_none());
        let config = ClusterConfig::emulated("me", "127.0.0.1", 6379, vec![]);
        publish_tl_config(Some(config.clone()));
        assert_eq!(tl_config().unwrap().my_id(), "me");
        publish_tl_config(None);
    }
}
