//! Node collection synced from the coordination store
//!
//! A live mapping of node name to node record. One serialized sync task
//! folds the initial snapshot and subsequent watch events, so an
//! observer that registers `on_add` and then calls `get_all` sees every
//! node that existed at or after registration time exactly once across
//! the two channels.

use super::node::{Node, NodeStatus};
use crate::coordination::{keys, CoordinationStore, WatchEvent};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type NodeCallback = Box<dyn Fn(&Node) + Send + Sync>;

const RESYNC_BACKOFF: Duration = Duration::from_secs(2);

/// Observable mapping of node name -> node record
pub struct NodeCollection {
    nodes: RwLock<HashMap<String, Node>>,
    on_add: RwLock<Vec<NodeCallback>>,
    on_remove: RwLock<Vec<NodeCallback>>,
}

impl NodeCollection {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            on_add: RwLock::new(Vec::new()),
            on_remove: RwLock::new(Vec::new()),
        })
    }

    /// Create a collection kept in sync with `/nodes/` in the store.
    /// The sync task runs until `cancel` fires, re-establishing its
    /// watch with backoff if the store connection drops.
    pub async fn synced(
        store: Arc<dyn CoordinationStore>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let collection = Self::empty();

        // Initial snapshot is applied before anyone can register hooks,
        // so it is observable only through get_all.
        let snapshot = store.list(keys::NODES).await?;
        {
            let mut nodes = collection.nodes.write();
            for kv in &snapshot.kvs {
                match serde_json::from_slice::<Node>(&kv.value) {
                    Ok(node) => {
                        nodes.insert(node.name.clone(), node);
                    }
                    Err(err) => warn!(key = %kv.key, %err, "skipping unparseable node record"),
                }
            }
        }

        let sync = Arc::clone(&collection);
        let mut revision = snapshot.revision;
        tokio::spawn(async move {
            loop {
                let mut events = match store.watch_prefix(keys::NODES, revision).await {
                    Ok(events) => events,
                    Err(err) => {
                        warn!(%err, "node watch failed, retrying");
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
                            Some(event) => {
                                revision = revision.max(event.revision());
                                sync.apply(event);
                            }
                            None => break,
                        },
                    }
                }
                warn!("node watch closed, re-establishing");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESYNC_BACKOFF) => {}
                }
            }
        });

        Ok(collection)
    }

    /// A detached collection for tests and tools that do not sync.
    pub fn detached() -> Arc<Self> {
        Self::empty()
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes.read().get(name).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, Node> {
        self.nodes.read().clone()
    }

    /// Register a hook fired for every node added after registration.
    pub fn on_add(&self, callback: impl Fn(&Node) + Send + Sync + 'static) {
        self.on_add.write().push(Box::new(callback));
    }

    /// Register a hook fired when a node is removed (tombstoned or its
    /// record deleted by an operator).
    pub fn on_remove(&self, callback: impl Fn(&Node) + Send + Sync + 'static) {
        self.on_remove.write().push(Box::new(callback));
    }

    /// Apply a single store event. Exposed within the crate so tests
    /// can drive the collection without a live watch.
    pub(crate) fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(kv) => {
                let node: Node = match serde_json::from_slice(&kv.value) {
                    Ok(node) => node,
                    Err(err) => {
                        warn!(key = %kv.key, %err, "skipping unparseable node record");
                        return;
                    }
                };
                let previous = {
                    let mut nodes = self.nodes.write();
                    nodes.insert(node.name.clone(), node.clone())
                };
                match previous {
                    None => {
                        info!(node = %node.name, status = %node.status, "node added");
                        for callback in self.on_add.read().iter() {
                            callback(&node);
                        }
                    }
                    Some(old) => {
                        if old.status != NodeStatus::Removed && node.status == NodeStatus::Removed {
                            info!(node = %node.name, "node removed");
                            for callback in self.on_remove.read().iter() {
                                callback(&node);
                            }
                        }
                    }
                }
            }
            WatchEvent::Delete { key, .. } => {
                let name = key.trim_start_matches(keys::NODES).to_string();
                let removed = self.nodes.write().remove(&name);
                if let Some(mut node) = removed {
                    node.status = NodeStatus::Removed;
                    info!(node = %node.name, "node record deleted");
                    for callback in self.on_remove.read().iter() {
                        callback(&node);
                    }
                }
            }
        }
    }
}

/// Persist a node record, enforcing the status lifecycle. Nodes write
/// only their own record; the one exception is an operator-initiated
/// tombstone, which also passes through here.
pub async fn save_node(store: &dyn CoordinationStore, node: &Node) -> Result<()> {
    let key = format!("{}{}", keys::NODES, node.name);
    if let Some(existing) = store.get(&key).await? {
        let existing: Node = serde_json::from_slice(&existing.value)?;
        if !existing.status.can_transition_to(node.status) {
            return Err(Error::InvalidTransition(
                existing.status.to_string(),
                node.status.to_string(),
            ));
        }
    }
    store.put(&key, serde_json::to_vec(node)?).await?;
    Ok(())
}

/// Load a node record by name.
pub async fn load_node(store: &dyn CoordinationStore, name: &str) -> Result<Option<Node>> {
    let key = format!("{}{}", keys::NODES, name);
    match store.get(&key).await? {
        Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
        None => Ok(None),
    }
}

/// Tombstone a node: mark the record Removed so watchers run their
/// removal hooks, keeping the record for audit.
pub async fn tombstone_node(store: &dyn CoordinationStore, name: &str) -> Result<()> {
    let mut node =
        load_node(store, name).await?.ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
    node.status = NodeStatus::Removed;
    let key = format!("{}{}", keys::NODES, name);
    store.put(&key, serde_json::to_vec(&node)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn up_node(name: &str) -> Node {
        let mut node = Node::new(name, format!("{name}:28086"));
        node.status = NodeStatus::Up;
        node
    }

    #[tokio::test]
    async fn test_snapshot_then_events_exactly_once() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        save_node(store.as_ref(), &up_node("a")).await.unwrap();

        let cancel = CancellationToken::new();
        let collection = NodeCollection::synced(Arc::clone(&store), cancel.clone())
            .await
            .unwrap();

        let added = Arc::new(AtomicUsize::new(0));
        let added_hook = Arc::clone(&added);
        collection.on_add(move |_| {
            added_hook.fetch_add(1, Ordering::SeqCst);
        });

        // Pre-existing node comes through get_all, not on_add.
        assert!(collection.get_all().contains_key("a"));
        assert_eq!(added.load(Ordering::SeqCst), 0);

        // A node registered after the hook comes through on_add.
        save_node(store.as_ref(), &up_node("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert!(collection.get("b").is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tombstone_fires_on_remove() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let cancel = CancellationToken::new();
        let collection = NodeCollection::synced(Arc::clone(&store), cancel.clone())
            .await
            .unwrap();

        let removed = Arc::new(AtomicUsize::new(0));
        let removed_hook = Arc::clone(&removed);
        collection.on_remove(move |node| {
            assert_eq!(node.status, NodeStatus::Removed);
            removed_hook.fetch_add(1, Ordering::SeqCst);
        });

        save_node(store.as_ref(), &up_node("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tombstone_node(store.as_ref(), "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // The tombstone stays visible.
        assert_eq!(collection.get("a").unwrap().status, NodeStatus::Removed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_save_rejects_status_regression() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        save_node(store.as_ref(), &up_node("a")).await.unwrap();

        let mut regressed = up_node("a");
        regressed.status = NodeStatus::Joining;
        let err = save_node(store.as_ref(), &regressed).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(..)));
    }
}
