//! Cluster membership, token placement and request routing
//!
//! This module owns the data-placement core: the node collection synced
//! from the coordination store, the token registry holding persistent
//! ownership, the consistent-hash resolver derived from both, the
//! partitioner mapping records to tokens, and the advisory gossip
//! overlay for low-latency liveness.

pub mod gossip;
pub mod identity;
pub mod node;
pub mod nodes;
pub mod partitioner;
pub mod resolver;
pub mod token_registry;

pub use gossip::{Gossip, GossipConfig, NodeMeta, TokenObserver};
pub use node::{Node, NodeStatus};
pub use nodes::NodeCollection;
pub use partitioner::{PartitionKey, Partitioner, DEFAULT_SHARD_TOKEN};
pub use resolver::{Replica, ResolveMode, Resolver};
pub use token_registry::TokenRegistry;

use std::time::Duration;

/// Tokens live in `[0, TOKEN_RANGE)`; the ring wraps at the upper bound.
pub const TOKEN_RANGE: u32 = 1 << 31;

/// Ring, registry and join behavior
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of tokens seeded by the bootstrap node
    pub initial_tokens: usize,
    /// TTL on token reservations taken during a join
    pub reservation_ttl: Duration,
    /// TTL on the registry lock; renewed while a join is in progress
    pub lock_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            initial_tokens: 16,
            reservation_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(30),
        }
    }
}
