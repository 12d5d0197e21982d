//! Configuration for the engine.

use std::time::Duration;

/// Main configuration for a node's engine.
///
/// Built with the `with_*` chain; every field has a sensible default so
/// tests can start from `EngineConfig::default()`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shards (worker threads / slices) this node runs.
    pub shard_count: u32,

    /// Total memory limit for the node, split evenly between shards.
    pub max_memory: usize,

    /// Run the slices in caching mode: reads bump entries and memory
    /// pressure evicts instead of rejecting inserts.
    pub cache_mode: bool,

    /// Cluster mode of the node.
    pub cluster_mode: ClusterMode,

    /// IP that cluster commands announce to clients. When empty, the bound
    /// address supplied by the connection layer is used.
    pub cluster_announce_ip: String,

    /// Port announced in cluster responses.
    pub port: u16,

    /// Enable eviction during heartbeat when memory is under pressure.
    pub enable_heartbeat_eviction: bool,

    /// The maximum number of key-value pairs deleted in each heartbeat
    /// eviction pass.
    pub max_eviction_per_heartbeat: u32,

    /// The maximum number of table segments scanned in each heartbeat
    /// eviction pass.
    pub max_segment_to_consider: u32,

    /// Deadline for quiescing in-flight commands during a cluster config
    /// change.
    pub config_change_quiesce_timeout: Duration,
}

/// How the node participates in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    /// Cluster commands are rejected.
    Disabled,
    /// Single node emulating a full cluster owning every slot.
    Emulated,
    /// Real multi-node cluster driven by pushed config documents.
    Enabled,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            max_memory: 256 * 1024 * 1024,
            cache_mode: false,
            cluster_mode: ClusterMode::Disabled,
            cluster_announce_ip: String::new(),
            port: 6379,
            enable_heartbeat_eviction: true,
            max_eviction_per_heartbeat: 100,
            max_segment_to_consider: 4,
            config_change_quiesce_timeout: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given shard count.
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
            ..Default::default()
        }
    }

    /// Set the total memory limit.
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Enable or disable caching mode.
    pub fn with_cache_mode(mut self, on: bool) -> Self {
        self.cache_mode = on;
        self
    }

    /// Set the cluster mode.
    pub fn with_cluster_mode(mut self, mode: ClusterMode) -> Self {
        self.cluster_mode = mode;
        self
    }

    /// Set the announced endpoint.
    pub fn with_announce(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.cluster_announce_ip = ip.into();
        self.port = port;
        self
    }

    /// Tune heartbeat eviction.
    pub fn with_heartbeat_eviction(mut self, enabled: bool, max_per_beat: u32) -> Self {
        self.enable_heartbeat_eviction = enabled;
        self.max_eviction_per_heartbeat = max_per_beat;
        self
    }

    /// Memory share of a single shard.
    pub fn shard_memory_budget(&self) -> usize {
        self.max_memory / self.shard_count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = EngineConfig::new(4)
            .with_max_memory(1 << 30)
            .with_cache_mode(true)
            .with_announce("10.0.0.5", 7000);

        assert_eq!(config.shard_count, 4);
        assert_eq!(config.shard_memory_budget(), (1 << 30) / 4);
        assert!(config.cache_mode);
        assert_eq!(config.cluster_announce_ip, "10.0.0.5");
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_zero_shards_clamped() {
        assert_eq!(EngineConfig::new(0).shard_count, 1);
    }
}
