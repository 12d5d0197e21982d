//! Error types for the key-value engine.

use thiserror::Error;

/// Result type alias for data-path operations.
pub type OpResult<T> = std::result::Result<T, OpError>;

/// Status of a data-path operation.
///
/// All of these are values reported to the caller; none of them cross a
/// boundary as a panic. Contract violations (running a post-update guard
/// after its key was deleted) are fatal assertions instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// Lookup miss, or the key expired during the lookup.
    #[error("key not found")]
    KeyNotFound,

    /// A type-checked lookup saw a different object type.
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,

    /// Insertion rejected by the eviction policy or the allocator.
    #[error("out of memory")]
    OutOfMemory,

    /// Expire deadline exceeds the compressed representation.
    #[error("expire deadline out of range")]
    OutOfRange,

    /// Expire update refused by an NX/XX/GT/LT flag.
    #[error("expire update skipped")]
    Skipped,

    /// The key's slot now belongs to a peer node.
    #[error("moved: slot {slot} owned by {host}:{port}")]
    KeyMoved { slot: u16, host: String, port: u16 },

    /// Malformed sub-command arguments.
    #[error("syntax error")]
    Syntax,

    /// Cluster-config JSON unparsable or self-inconsistent.
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by the cluster control plane (config install, migrations).
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Cluster support is disabled.
    #[error("cluster is disabled")]
    Disabled,

    /// No configuration has been installed yet.
    #[error("cluster is not configured")]
    NotConfigured,

    /// A migration with the same endpoint is already registered.
    #[error("migration already in progress for {host}:{port}")]
    MigrationExists { host: String, port: u16 },

    /// Referenced sync id is unknown.
    #[error("sync id not found: {0}")]
    SyncIdNotFound(u32),

    /// A migration range refers to slots this node does not own.
    #[error("invalid slots range")]
    InvalidSlotRange,

    /// Malformed sub-command arguments.
    #[error("syntax error")]
    Syntax,

    /// Config document failed parsing or validation.
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_display() {
        assert_eq!(OpError::KeyNotFound.to_string(), "key not found");
        let moved = OpError::KeyMoved {
            slot: 42,
            host: "10.0.0.1".into(),
            port: 6379,
        };
        assert_eq!(moved.to_string(), "moved: slot 42 owned by 10.0.0.1:6379");
    }

    #[test]
    fn test_cluster_error_from_json() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let cluster: ClusterError = err.into();
        assert!(matches!(cluster, ClusterError::InvalidConfig(_)));
    }
}
