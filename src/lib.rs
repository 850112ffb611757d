//! # fluxgate
//!
//! The coordination and data-placement core of a high-availability
//! clustering layer for time-series databases.
//!
//! A fleet of fluxgate nodes fronts a set of eventually-consistent
//! database instances. For every incoming write or query the core decides
//! which backends are responsible, and when the cluster membership
//! changes it coordinates the movement of data between instances.
//!
//! ## Key pieces
//!
//! - **Token ring**: a consistent-hash ring of partition tokens maps
//!   request keys to an ordered replica list with configurable
//!   replication factor
//! - **Coordination store**: membership, token ownership, partition-key
//!   declarations and settings live in a strongly-consistent store
//!   (etcd in production, in-memory for development) and are watched
//!   for changes
//! - **Join/rebalance protocol**: new nodes steal tokens from
//!   incumbents, import primary and replicated data, then take
//!   ownership atomically
//! - **Hinted handoff**: writes that cannot reach a replica are parked
//!   in a durable local log and replayed when the replica returns
//! - **Reliable work queue**: long-running import/delete jobs run with
//!   at-least-once semantics and survive crashes

pub mod api;
pub mod cluster;
pub mod coordination;
pub mod hints;
pub mod rebalance;

mod error;

pub use error::{Error, Result};

/// Top-level configuration for a fluxgate node
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Coordination store connection
    pub coordination: coordination::CoordinationConfig,
    /// Ring, registry and join behavior
    pub cluster: cluster::ClusterConfig,
    /// Gossip overlay
    pub gossip: cluster::GossipConfig,
    /// Hinted handoff
    pub hints: hints::HintConfig,
    /// Reliable work queue
    pub work_queue: rebalance::WorkQueueConfig,
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{
        Node, NodeCollection, NodeStatus, Partitioner, ResolveMode, Resolver, TokenRegistry,
    };
    pub use crate::coordination::{CoordinationStore, EtcdCoordinator, MemoryCoordinator};
    pub use crate::hints::{HintStore, RecoveryDriver};
    pub use crate::rebalance::{Importer, JoinProtocol, WorkQueue, WorkQueueConsumer};
    pub use crate::{Config, Error, Result};
}
