//! Coordination store abstraction
//!
//! Cluster-wide state (membership, token ownership, partition keys,
//! settings, hints markers, work items) lives in a strongly-consistent
//! store with a hierarchical key space. This module abstracts the store
//! behind a trait so the same components run against etcd in production
//! and an in-memory implementation in development and tests.

mod etcd;
mod memory;
pub mod settings;

pub use etcd::EtcdCoordinator;
pub use memory::MemoryCoordinator;
pub use settings::SettingsStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Key prefixes used by fluxgate components. Everything the cluster
/// persists in the coordination store lives under one of these.
pub mod keys {
    /// Node records, one per member: `/nodes/<name>`
    pub const NODES: &str = "/nodes/";
    /// Token ownership: `/tokens/<token>` with value = owner name
    pub const TOKENS: &str = "/tokens/";
    /// Marker proving the token set has been seeded
    pub const TOKENS_INIT: &str = "/tokens/_init";
    /// Distributed lock serializing joins
    pub const TOKENS_LOCK: &str = "/tokens/_lock";
    /// Short-lived token reservations: `/tokens/_reserved/<token>`
    pub const TOKENS_RESERVED: &str = "/tokens/_reserved/";
    /// Hint markers: `/hints/<target>/<id>`
    pub const HINTS: &str = "/hints/";
    /// Work queue items: `/workqueue/<target>/<id>`
    pub const WORK_QUEUE: &str = "/workqueue/";
    /// Partition key declarations: `/partitions/<db>/<measurement>`
    pub const PARTITIONS: &str = "/partitions/";
    /// Cluster-wide default replication factor
    pub const REPLICATION_FACTOR: &str = "/settings/replicationFactor";
}

/// A key/value pair read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Store revision at which this value was last written
    pub revision: i64,
}

/// A consistent prefix read
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    /// Store revision the snapshot was taken at; pass to `watch_prefix`
    /// to observe every later change exactly once
    pub revision: i64,
}

/// A single change delivered by a watch, in store order
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Handle to a held distributed lock. Dropping the guard does NOT
/// release the lock; call [`CoordinationStore::unlock`] so release
/// failures are observable. The embedded token cancels the lease
/// renewal task for backends that need one.
#[derive(Debug)]
pub struct LockGuard {
    /// Lock name as passed to `lock`
    pub(crate) name: String,
    /// Backend-specific ownership key
    pub(crate) key: Vec<u8>,
    /// Lease backing the lock, when the backend uses one
    pub(crate) lease: i64,
    pub(crate) renewal: CancellationToken,
}

/// Coordination store interface
///
/// Required capabilities, per the cluster design: hierarchical keys,
/// atomic compare-and-set, prefix watch with resumable revision, and a
/// per-key distributed lock with TTL. All operations may block on the
/// network and must be treated as cancellation points by callers.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Write a key unconditionally. Returns the new revision. The write
    /// is durable (fsynced/quorum-acked) when this returns.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// Delete a key. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Read all keys under a prefix, with the revision of the read.
    async fn list(&self, prefix: &str) -> Result<Snapshot>;

    /// Create a key only if it does not exist. With a TTL the key
    /// expires on its own; an expired key counts as absent. Returns
    /// true if this call created the key.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Replace a key's value only if its current revision matches
    /// `expected_revision`. Returns false on mismatch (including a
    /// concurrently deleted key).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: Vec<u8>,
    ) -> Result<bool>;

    /// Watch a prefix for changes after `revision` (exclusive). Events
    /// from one watch arrive in store order on the returned channel.
    /// The watch runs until the receiver is dropped.
    async fn watch_prefix(&self, prefix: &str, revision: i64) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Acquire the distributed lock named `key`, blocking until it is
    /// available. The lock is held under a TTL and renewed until
    /// released, so a crashed holder cannot wedge it forever.
    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard>;

    /// Release a lock acquired with [`lock`](Self::lock).
    async fn unlock(&self, guard: LockGuard) -> Result<()>;
}

/// Connection settings for the coordination store
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// etcd endpoints; empty selects the in-memory store (development)
    pub endpoints: Vec<String>,
    /// Dial timeout for the initial connection
    pub dial_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Buffer size for watch channels. Watches are serialized per handler,
/// so a small bound is enough to absorb bursts without unbounded memory.
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 256;
