use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::NodeId;

/// Timer settings for elections, heartbeats and outbound RPCs.
///
/// The election deadline is `base + jitter`, where the jitter is drawn in
/// `timer_granularity_ms` steps from `[0, election_jitter_ms)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub election_timeout_base_ms: u64,
    pub election_jitter_ms: u64,
    pub timer_granularity_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound a transport waits for a peer's reply
    pub rpc_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_base_ms: 250,
            election_jitter_ms: 240,
            timer_granularity_ms: 10,
            heartbeat_interval_ms: 150,
            rpc_timeout_ms: 100,
        }
    }
}

impl TimingConfig {
    /// Shortened timings for in-process clusters and tests.
    pub fn fast() -> Self {
        Self {
            election_timeout_base_ms: 100,
            election_jitter_ms: 100,
            timer_granularity_ms: 10,
            heartbeat_interval_ms: 30,
            rpc_timeout_ms: 50,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Identity and cluster shape of a single replica. Fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_port: u16,
    /// Cluster size, this node included. Members are `0..num_peers`.
    pub num_peers: u64,
    pub timing: TimingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_port: 50051,
            num_peers: 1,
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, listen_port: u16, num_peers: u64) -> Self {
        Self {
            node_id,
            listen_port,
            num_peers,
            ..Default::default()
        }
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Every cluster member except this node.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        (0..self.num_peers).filter(|&id| id != self.node_id).collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.num_peers as usize
    }

    /// Smallest strict majority of the cluster.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_peers == 0 {
            return Err(RaftError::Config("num_peers must be at least 1".into()));
        }
        if self.node_id >= self.num_peers {
            return Err(RaftError::Config(format!(
                "node_id {} outside cluster of {} nodes",
                self.node_id, self.num_peers
            )));
        }
        if self.timing.timer_granularity_ms == 0 {
            return Err(RaftError::Config(
                "timer_granularity_ms must be non-zero".into(),
            ));
        }
        if self.timing.heartbeat_interval_ms >= self.timing.election_timeout_base_ms {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be below election timeout {}ms",
                self.timing.heartbeat_interval_ms, self.timing.election_timeout_base_ms
            )));
        }
        Ok(())
    }
}
