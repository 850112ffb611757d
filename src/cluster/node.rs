//! Cluster node records

use serde::{Deserialize, Serialize};

/// Status of a node within the cluster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node has registered but holds no tokens yet
    Joining,
    /// Node is importing data; writes to it are rejected
    Recovering,
    /// Node is healthy and owns its tokens
    Up,
    /// Node has left the cluster; record is kept as a tombstone
    Removed,
}

impl NodeStatus {
    fn rank(self) -> u8 {
        match self {
            NodeStatus::Joining => 0,
            NodeStatus::Recovering => 1,
            NodeStatus::Up => 2,
            NodeStatus::Removed => 3,
        }
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// Transitions are monotone within a cluster epoch: a node never
    /// regresses to Joining, and Removed is terminal. The one backward
    /// edge is Up -> Recovering, taken when a returning node finds
    /// hints addressed to it.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (NodeStatus::Removed, _) => false,
            (NodeStatus::Up, NodeStatus::Recovering) => true,
            (_, NodeStatus::Joining) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Recovering => "recovering",
            NodeStatus::Up => "up",
            NodeStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A member of the cluster
///
/// The name is chosen once and persisted; the authoritative token set
/// lives in the token registry and is cached here for gossip and
/// display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable unique name
    pub name: String,
    /// Endpoint of the backend database this node fronts
    pub data_location: String,
    /// Lifecycle status
    pub status: NodeStatus,
    /// Cached token ownership
    #[serde(default)]
    pub tokens: Vec<u32>,
}

impl Node {
    pub fn new(name: impl Into<String>, data_location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_location: data_location.into(),
            status: NodeStatus::Joining,
            tokens: Vec::new(),
        }
    }

    /// Whether this node may receive writes.
    pub fn can_accept_writes(&self) -> bool {
        self.status == NodeStatus::Up
    }

    /// Whether this node may serve reads.
    pub fn can_serve_reads(&self) -> bool {
        matches!(self.status, NodeStatus::Up)
    }
}
