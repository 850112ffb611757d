//! Token ring and replica resolution
//!
//! The resolver maps partition tokens to the ordered list of nodes
//! responsible for them. The ring is derived state: the token registry
//! is authoritative and a sync task replays its watch events into the
//! resolver. Reads vastly outnumber writes, so the ring sits behind a
//! `parking_lot::RwLock` with brief critical sections.

use super::node::NodeStatus;
use super::nodes::NodeCollection;
use crate::coordination::{keys, CoordinationStore, WatchEvent};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a resolved replica list will be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Caller will read from the first healthy replica
    Read,
    /// Caller must deliver to every replica
    Write,
}

/// One entry of a replica list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub node: String,
    pub data_location: String,
}

#[derive(Debug, Default)]
struct RingState {
    /// token -> owning node, ordered by token value
    ring: BTreeMap<u32, String>,
    /// node -> owned tokens
    by_node: HashMap<String, BTreeSet<u32>>,
}

impl RingState {
    fn set(&mut self, token: u32, node: &str) {
        if let Some(old) = self.ring.insert(token, node.to_string()) {
            if old != node {
                if let Some(tokens) = self.by_node.get_mut(&old) {
                    tokens.remove(&token);
                    if tokens.is_empty() {
                        self.by_node.remove(&old);
                    }
                }
            }
        }
        self.by_node.entry(node.to_string()).or_default().insert(token);
    }

    fn remove(&mut self, token: u32) -> Option<String> {
        let owner = self.ring.remove(&token)?;
        if let Some(tokens) = self.by_node.get_mut(&owner) {
            tokens.remove(&token);
            if tokens.is_empty() {
                self.by_node.remove(&owner);
            }
        }
        Some(owner)
    }

    /// Walk the ring clockwise from `token`, collecting the first
    /// `count` distinct owners. Deterministic for a fixed ring.
    fn walk(&self, token: u32, count: usize) -> Vec<String> {
        let mut owners: Vec<String> = Vec::with_capacity(count);
        if count == 0 {
            return owners;
        }
        let clockwise = self
            .ring
            .range(token..)
            .chain(self.ring.range(..token))
            .map(|(_, owner)| owner);
        for owner in clockwise {
            if owners.iter().any(|seen| seen == owner) {
                continue;
            }
            owners.push(owner.clone());
            if owners.len() == count {
                break;
            }
        }
        owners
    }
}

/// Maps tokens to replica lists
pub struct Resolver {
    state: parking_lot::RwLock<RingState>,
    nodes: Arc<NodeCollection>,
    replication_factor: AtomicUsize,
}

impl Resolver {
    pub fn new(nodes: Arc<NodeCollection>, replication_factor: usize) -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::RwLock::new(RingState::default()),
            nodes,
            replication_factor: AtomicUsize::new(replication_factor.max(1)),
        })
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor.load(Ordering::Relaxed)
    }

    pub fn set_replication_factor(&self, factor: usize) {
        self.replication_factor.store(factor.max(1), Ordering::Relaxed);
    }

    /// Resolve a token to its ordered replica list. Both modes return
    /// the full list; readers are expected to use the first healthy
    /// entry, writers to deliver to all of them. With fewer distinct
    /// nodes than the replication factor, all of them are returned.
    pub fn resolve(&self, token: u32, _mode: ResolveMode) -> Vec<Replica> {
        let factor = self.replication_factor();
        let owners = self.state.read().walk(token, factor);
        owners
            .into_iter()
            .map(|name| {
                let data_location = self
                    .nodes
                    .get(&name)
                    .map(|node| node.data_location)
                    .unwrap_or_default();
                Replica {
                    node: name,
                    data_location,
                }
            })
            .collect()
    }

    /// The primary owner for a token: the owner of the first ring entry
    /// at or clockwise of `token`.
    pub fn find_primary(&self, token: u32) -> Option<String> {
        self.state.read().walk(token, 1).into_iter().next()
    }

    /// All other ring tokens whose replica list includes the owner of
    /// `token` as a secondary. During a rebalance this is the
    /// replicated data that must follow a stolen primary.
    pub fn reverse_secondary_lookup(&self, token: u32) -> Vec<u32> {
        let factor = self.replication_factor();
        let state = self.state.read();
        let Some(owner) = state.walk(token, 1).into_iter().next() else {
            return Vec::new();
        };
        state
            .ring
            .keys()
            .filter(|&&candidate| {
                let owners = state.walk(candidate, factor);
                owners.len() > 1 && owners[0] != owner && owners[1..].contains(&owner)
            })
            .copied()
            .collect()
    }

    /// Place (or re-place) a token. Ownership moves are legal: the
    /// registry's Assign terminates any prior ownership and the ring
    /// follows. Token uniqueness is structural here; duplicate seeding
    /// is rejected upstream in the registry.
    pub fn add_token(&self, token: u32, node: &str) {
        self.state.write().set(token, node);
    }

    /// Drop a token from the ring, returning its previous owner.
    pub fn remove_token(&self, token: u32) -> Option<String> {
        self.state.write().remove(token)
    }

    /// Drop a token only if `node` still owns it. Used by advisory
    /// sources (gossip) that may lag behind the registry.
    pub fn remove_token_owned_by(&self, token: u32, node: &str) -> bool {
        let mut state = self.state.write();
        if state.ring.get(&token).is_some_and(|owner| owner == node) {
            state.remove(token);
            true
        } else {
            false
        }
    }

    /// Replace the whole ring with the registry snapshot. Used on sync
    /// (re)start, when the registry is authoritative over anything the
    /// gossip overlay may have applied in the meantime.
    pub fn replace_ring(&self, assignments: &HashMap<u32, String>) {
        let mut state = self.state.write();
        *state = RingState::default();
        for (token, owner) in assignments {
            state.set(*token, owner);
        }
    }

    /// All tokens owned by `node`.
    pub fn tokens_of(&self, node: &str) -> Vec<u32> {
        self.state
            .read()
            .by_node
            .get(node)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn ring_len(&self) -> usize {
        self.state.read().ring.len()
    }

    /// Snapshot of the ring for display.
    pub fn ring_entries(&self) -> Vec<(u32, String)> {
        self.state
            .read()
            .ring
            .iter()
            .map(|(token, owner)| (*token, owner.clone()))
            .collect()
    }

    /// Whether any replica of `token` is Up, i.e. requests for it can
    /// be served at all.
    pub fn has_live_replica(&self, token: u32) -> bool {
        self.resolve(token, ResolveMode::Read)
            .iter()
            .any(|replica| {
                self.nodes
                    .get(&replica.node)
                    .is_some_and(|node| node.status == NodeStatus::Up)
            })
    }
}

const RESYNC_BACKOFF: Duration = Duration::from_secs(2);

fn parse_token_key(key: &str) -> Option<u32> {
    // Skips registry bookkeeping keys (_init, _lock, _reserved/...).
    key.strip_prefix(keys::TOKENS)?.parse::<u32>().ok()
}

/// Keep a resolver in sync with `/tokens/` in the coordination store.
/// Runs until cancelled, reconciling from a fresh snapshot whenever the
/// watch has to be re-established.
pub async fn run_ring_sync(
    resolver: Arc<Resolver>,
    store: Arc<dyn CoordinationStore>,
    cancel: CancellationToken,
) {
    loop {
        let snapshot = match store.list(keys::TOKENS).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "token snapshot failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESYNC_BACKOFF) => continue,
                }
            }
        };

        let mut assignments = HashMap::new();
        for kv in &snapshot.kvs {
            if let Some(token) = parse_token_key(&kv.key) {
                assignments.insert(token, String::from_utf8_lossy(&kv.value).to_string());
            }
        }
        resolver.replace_ring(&assignments);
        debug!(tokens = assignments.len(), "ring reconciled from registry");

        let mut events = match store.watch_prefix(keys::TOKENS, snapshot.revision).await {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "token watch failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESYNC_BACKOFF) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(WatchEvent::Put(kv)) => {
                        if let Some(token) = parse_token_key(&kv.key) {
                            let owner = String::from_utf8_lossy(&kv.value);
                            resolver.add_token(token, &owner);
                        }
                    }
                    Some(WatchEvent::Delete { key, .. }) => {
                        if let Some(token) = parse_token_key(&key) {
                            resolver.remove_token(token);
                        }
                    }
                    None => break,
                },
            }
        }
        warn!("token watch closed, re-establishing");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESYNC_BACKOFF) => {}
        }
    }
}
