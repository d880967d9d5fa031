pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{QuorumError, Result};

/// Static membership and timing for one consensus group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeId>,          // Every member, self included
    pub election_timeout_ms: u64,    // Base T; timeouts are drawn from [T, 2T)
    pub heartbeat_interval_ms: u64,  // Leader's periodic replication trigger
    pub rpc_timeout_ms: u64,         // Upper bound on a single peer call
    pub max_append_entries: usize,   // Batch cap per AppendEntries
    pub event_queue_depth: usize,    // Bound on the replica's inbox
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            election_timeout_ms: 150,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_append_entries: 64,
            event_queue_depth: 256,
        }
    }
}

impl ClusterConfig {
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Members other than `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.iter().copied().filter(|n| *n != id).collect()
    }

    /// Checks the invariants a running replica relies on.
    ///
    /// The heartbeat must fit at least twice into the election timeout so a
    /// healthy leader never lets a follower time out.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(QuorumError::Config("cluster has no members".into()));
        }
        let unique: HashSet<_> = self.nodes.iter().collect();
        if unique.len() != self.nodes.len() {
            return Err(QuorumError::Config("duplicate node id in membership".into()));
        }
        if self.election_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(QuorumError::Config("timeouts must be non-zero".into()));
        }
        let fits_twice = self
            .heartbeat_interval_ms
            .checked_mul(2)
            .is_some_and(|twice| twice <= self.election_timeout_ms);
        if !fits_twice {
            return Err(QuorumError::Config(format!(
                "heartbeat_interval_ms ({}) must be at most half of election_timeout_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(QuorumError::Config("rpc_timeout_ms must be non-zero".into()));
        }
        if self.max_append_entries == 0 {
            return Err(QuorumError::Config("max_append_entries must be non-zero".into()));
        }
        if self.event_queue_depth == 0 {
            return Err(QuorumError::Config("event_queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_serialization() {
        let config = ClusterConfig::with_nodes([1, 2, 3]);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ClusterConfig = serde_json::from_str(r#"{"nodes":[1,2,3]}"#).unwrap();
        assert_eq!(config.election_timeout_ms, 150);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert_eq!(config.max_append_entries, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(ClusterConfig::default().validate().is_err());
        assert!(ClusterConfig::with_nodes([1, 2, 2]).validate().is_err());

        let mut slow_heartbeat = ClusterConfig::with_nodes([1, 2, 3]);
        slow_heartbeat.heartbeat_interval_ms = 100;
        assert!(slow_heartbeat.validate().is_err());

        let mut no_batch = ClusterConfig::with_nodes([1, 2, 3]);
        no_batch.max_append_entries = 0;
        assert!(no_batch.validate().is_err());
    }

    #[test]
    fn test_validate_huge_heartbeat_is_rejected_not_overflowed() {
        let mut config = ClusterConfig::with_nodes([1, 2, 3]);
        config.heartbeat_interval_ms = u64::MAX;
        config.election_timeout_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(QuorumError::Config(_))));
    }

    #[test]
    fn test_peers_of_excludes_self() {
        let config = ClusterConfig::with_nodes([1, 2, 3]);
        assert_eq!(config.peers_of(2), vec![1, 3]);
    }
}
