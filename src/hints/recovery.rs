//! Hint replay and recovery
//!
//! One recovery driver runs per node. It scans the local hint store for
//! targets, and when the node collection reports a target Up, streams
//! its hints in order, deleting each on acknowledgment. A failed target
//! is left alone for a jittered exponential backoff. The flip side is
//! [`wait_until_recovered`]: a returning node with markers addressed to
//! it stays in Recovering until the other nodes have drained them.

use super::store::HintStore;
use super::HintConfig;
use crate::cluster::{Node, NodeCollection, NodeStatus};
use crate::coordination::{keys, CoordinationStore};
use crate::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivers a buffered write to a recovered replica
#[async_trait]
pub trait HintReplayer: Send + Sync {
    async fn replay(&self, target: &Node, payload: &[u8]) -> Result<()>;
}

/// Replays hints over the backend database's HTTP write path
pub struct HttpHintReplayer {
    client: reqwest::Client,
}

impl HttpHintReplayer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHintReplayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HintReplayer for HttpHintReplayer {
    async fn replay(&self, target: &Node, payload: &[u8]) -> Result<()> {
        let url = format!("http://{}/write", target.data_location);
        self.client
            .post(&url)
            .body(payload.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

struct TargetBackoff {
    failures: u32,
    retry_at: Instant,
}

/// Detects recovered targets and drains their hints
pub struct RecoveryDriver {
    hints: Arc<Mutex<HintStore>>,
    nodes: Arc<NodeCollection>,
    replayer: Arc<dyn HintReplayer>,
    config: HintConfig,
    backoffs: parking_lot::Mutex<HashMap<String, TargetBackoff>>,
}

impl RecoveryDriver {
    pub fn new(
        hints: Arc<Mutex<HintStore>>,
        nodes: Arc<NodeCollection>,
        replayer: Arc<dyn HintReplayer>,
        config: HintConfig,
    ) -> Self {
        Self {
            hints,
            nodes,
            replayer,
            config,
            backoffs: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Run until cancelled, scanning on the configured interval.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.replay_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.run_pass().await {
                warn!(%err, "hint replay pass failed");
            }
        }
    }

    /// One replay pass over every target that is Up and not backing
    /// off. Returns the number of hints replayed.
    pub async fn run_pass(&self) -> Result<usize> {
        let targets = self.hints.lock().await.targets();
        let now = Instant::now();
        let mut replayed_total = 0;

        for target in targets {
            let backing_off = self
                .backoffs
                .lock()
                .get(&target)
                .is_some_and(|backoff| backoff.retry_at > now);
            if backing_off {
                continue;
            }
            let Some(node) = self.nodes.get(&target) else {
                debug!(target = %target, "hint target unknown, keeping hints");
                continue;
            };
            if node.status != NodeStatus::Up {
                continue;
            }
            match self.drain_target(&node).await {
                Ok(replayed) => {
                    self.backoffs.lock().remove(&target);
                    replayed_total += replayed;
                    if replayed > 0 {
                        info!(target = %target, replayed, "hints replayed");
                    }
                }
                Err(err) => {
                    let mut backoffs = self.backoffs.lock();
                    let failures = backoffs.get(&target).map_or(0, |b| b.failures) + 1;
                    let delay =
                        backoff_delay(self.config.backoff_base, self.config.backoff_cap, failures);
                    warn!(target = %target, failures, delay_ms = delay.as_millis() as u64, %err,
                        "hint replay failed, backing off");
                    backoffs.insert(
                        target,
                        TargetBackoff {
                            failures,
                            retry_at: Instant::now() + delay,
                        },
                    );
                }
            }
        }
        Ok(replayed_total)
    }

    /// Whether a target is currently in a backoff window.
    pub fn is_backing_off(&self, target: &str) -> bool {
        self.backoffs
            .lock()
            .get(target)
            .is_some_and(|backoff| backoff.retry_at > Instant::now())
    }

    /// Stream one target's hints in order, deleting each on ack.
    async fn drain_target(&self, node: &Node) -> Result<usize> {
        let pending = self.hints.lock().await.get_by_target(&node.name);
        let mut replayed = 0;
        for hint in pending {
            self.replayer.replay(node, &hint.payload).await?;
            self.hints.lock().await.delete(&node.name, hint.id).await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

/// Jittered exponential backoff, capped.
fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << failures.min(16).saturating_sub(1));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    capped + capped.mul_f64(jitter)
}

/// Block while other nodes hold hints addressed to `node_name`. The
/// caller keeps the node in Recovering for the duration and flips it to
/// Up when this returns.
pub async fn wait_until_recovered(store: &dyn CoordinationStore, node_name: &str) -> Result<()> {
    let prefix = format!("{}{}/", keys::HINTS, node_name);
    loop {
        let snapshot = store.list(&prefix).await?;
        if snapshot.kvs.is_empty() {
            return Ok(());
        }
        debug!(
            node = node_name,
            pending = snapshot.kvs.len(),
            "waiting for hinted data to drain"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::nodes::save_node;
    use crate::coordination::MemoryCoordinator;
    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;

    struct RecordingReplayer {
        delivered: SyncMutex<Vec<(String, Vec<u8>)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingReplayer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: SyncMutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl HintReplayer for RecordingReplayer {
        async fn replay(&self, target: &Node, payload: &[u8]) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::Error::Internal("target unreachable".to_string()));
            }
            self.delivered
                .lock()
                .push((target.name.clone(), payload.to_vec()));
            Ok(())
        }
    }

    async fn driver_fixture(
        dir: &TempDir,
        target_status: NodeStatus,
    ) -> (RecoveryDriver, Arc<Mutex<HintStore>>, Arc<RecordingReplayer>) {
        let hints = Arc::new(Mutex::new(
            HintStore::open(dir.path(), "origin", None).await.unwrap(),
        ));
        let nodes = NodeCollection::detached();
        let mut target = Node::new("node-b", "127.0.0.1:28086");
        target.status = target_status;
        nodes.apply(crate::coordination::WatchEvent::Put(
            crate::coordination::KeyValue {
                key: "/nodes/node-b".to_string(),
                value: serde_json::to_vec(&target).unwrap(),
                revision: 1,
            },
        ));
        let replayer = RecordingReplayer::new();
        let driver = RecoveryDriver::new(
            Arc::clone(&hints),
            nodes,
            Arc::clone(&replayer) as Arc<dyn HintReplayer>,
            HintConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        (driver, hints, replayer)
    }

    #[tokio::test]
    async fn test_replays_in_order_and_deletes() {
        let dir = TempDir::new().unwrap();
        let (driver, hints, replayer) = driver_fixture(&dir, NodeStatus::Up).await;
        {
            let mut store = hints.lock().await;
            store.put("node-b", b"first").await.unwrap();
            store.put("node-b", b"second").await.unwrap();
        }

        let replayed = driver.run_pass().await.unwrap();
        assert_eq!(replayed, 2);

        let delivered = replayer.delivered.lock().clone();
        assert_eq!(delivered[0].1, b"first");
        assert_eq!(delivered[1].1, b"second");
        assert!(hints.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_skips_targets_that_are_not_up() {
        let dir = TempDir::new().unwrap();
        let (driver, hints, replayer) = driver_fixture(&dir, NodeStatus::Recovering).await;
        hints.lock().await.put("node-b", b"held").await.unwrap();

        driver.run_pass().await.unwrap();
        assert!(replayer.delivered.lock().is_empty());
        assert_eq!(hints.lock().await.get_by_target("node-b").len(), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_keeps_hints() {
        let dir = TempDir::new().unwrap();
        let (driver, hints, replayer) = driver_fixture(&dir, NodeStatus::Up).await;
        hints.lock().await.put("node-b", b"held").await.unwrap();
        replayer.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        driver.run_pass().await.unwrap();
        assert!(driver.is_backing_off("node-b"));
        assert_eq!(hints.lock().await.get_by_target("node-b").len(), 1);

        // While backing off the target is not retried, even though the
        // replayer would now succeed.
        replayer.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        driver.run_pass().await.unwrap();
        assert!(replayer.delivered.lock().is_empty());
        assert_eq!(hints.lock().await.get_by_target("node-b").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_recovered_unblocks_on_empty() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let mut local = Node::new("node-a", "127.0.0.1:28086");
        local.status = NodeStatus::Up;
        save_node(coordinator.as_ref(), &local).await.unwrap();

        coordinator
            .put("/hints/node-a/7", b"origin".to_vec())
            .await
            .unwrap();

        let store = Arc::clone(&coordinator);
        let waiter = tokio::spawn(async move {
            wait_until_recovered(store.as_ref(), "node-a").await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        // Drain the last marker; the waiter returns.
        coordinator.delete("/hints/node-a/7").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should finish once hints drain")
            .unwrap();
    }
}
