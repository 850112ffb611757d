//! In-memory coordination store for development and testing
//!
//! Single-process stand-in for etcd with the same semantics the cluster
//! relies on: monotonic revisions, compare-and-set, resumable prefix
//! watches, TTL'd keys and a renewable lock. Suitable for development,
//! tests, and single-node deployments.

use super::{
    CoordinationStore, KeyValue, LockGuard, Snapshot, WatchEvent, WATCH_CHANNEL_CAPACITY,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct MemEntry {
    value: Vec<u8>,
    revision: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl MemEntry {
    fn alive(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug)]
struct HeldLock {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemState {
    revision: i64,
    kvs: BTreeMap<String, MemEntry>,
    /// Every event ever published, for resumable watches
    history: Vec<WatchEvent>,
    locks: HashMap<String, HeldLock>,
}

/// In-memory coordination store
///
/// Expired TTL keys are reclaimed lazily on read; no delete event is
/// published for them, matching how callers treat expiry (an expired
/// reservation simply counts as absent).
pub struct MemoryCoordinator {
    state: Arc<Mutex<MemState>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            events,
        }
    }

    fn publish(&self, state: &mut MemState, event: WatchEvent) {
        state.history.push(event.clone());
        // No receivers is fine; watches replay from history.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.state.lock();
        let now = Utc::now();
        Ok(state.kvs.get(key).filter(|e| e.alive(now)).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: value.clone(),
                revision,
                expires_at: None,
            },
        );
        self.publish(
            &mut state,
            WatchEvent::Put(KeyValue {
                key: key.to_string(),
                value,
                revision,
            }),
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Utc::now();
        match state.kvs.remove(key) {
            Some(entry) if entry.alive(now) => {
                state.revision += 1;
                let revision = state.revision;
                self.publish(
                    &mut state,
                    WatchEvent::Delete {
                        key: key.to_string(),
                        revision,
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.state.lock();
        let now = Utc::now();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.alive(now))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.revision,
            })
            .collect();
        Ok(Snapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Utc::now();
        if state.kvs.get(key).is_some_and(|e| e.alive(now)) {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        let expires_at = ttl.map(|ttl| now + chrono::Duration::milliseconds(ttl.as_millis() as i64));
        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: value.clone(),
                revision,
                expires_at,
            },
        );
        self.publish(
            &mut state,
            WatchEvent::Put(KeyValue {
                key: key.to_string(),
                value,
                revision,
            }),
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: Vec<u8>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let matches = state
            .kvs
            .get(key)
            .is_some_and(|e| e.alive(now) && e.revision == expected_revision);
        if !matches {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: value.clone(),
                revision,
                expires_at: None,
            },
        );
        self.publish(
            &mut state,
            WatchEvent::Put(KeyValue {
                key: key.to_string(),
                value,
                revision,
            }),
        );
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str, revision: i64) -> Result<mpsc::Receiver<WatchEvent>> {
        let prefix = prefix.to_string();
        // Subscribe and snapshot history under one lock so no event can
        // fall between the two.
        let (backlog, snapshot_revision, mut live) = {
            let state = self.state.lock();
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.key().starts_with(&prefix) && e.revision() > revision)
                .cloned()
                .collect();
            (backlog, state.revision, self.events.subscribe())
        };

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for event in backlog {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if !event.key().starts_with(&prefix) || event.revision() <= snapshot_revision
                        {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(prefix = %prefix, missed, "memory watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        let holder = Uuid::new_v4().to_string();
        let ttl_chrono = chrono::Duration::milliseconds(ttl.as_millis() as i64);
        loop {
            {
                let mut state = self.state.lock();
                let now = Utc::now();
                let free = state
                    .locks
                    .get(key)
                    .map_or(true, |held| held.expires_at <= now);
                if free {
                    state.locks.insert(
                        key.to_string(),
                        HeldLock {
                            holder: holder.clone(),
                            expires_at: now + ttl_chrono,
                        },
                    );
                    break;
                }
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }

        // Renew until released so a long critical section outlives the TTL.
        let renewal = CancellationToken::new();
        let renew_state = Arc::clone(&self.state);
        let renew_key = key.to_string();
        let renew_holder = holder.clone();
        let renew_token = renewal.clone();
        tokio::spawn(async move {
            let interval = ttl / 3;
            loop {
                tokio::select! {
                    _ = renew_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut state = renew_state.lock();
                match state.locks.get_mut(&renew_key) {
                    Some(held) if held.holder == renew_holder => {
                        held.expires_at = Utc::now() + ttl_chrono;
                    }
                    _ => return,
                }
            }
        });

        Ok(LockGuard {
            name: key.to_string(),
            key: holder.into_bytes(),
            lease: 0,
            renewal,
        })
    }

    async fn unlock(&self, guard: LockGuard) -> Result<()> {
        guard.renewal.cancel();
        let holder = String::from_utf8_lossy(&guard.key).to_string();
        let mut state = self.state.lock();
        if state
            .locks
            .get(&guard.name)
            .is_some_and(|held| held.holder == holder)
        {
            state.locks.remove(&guard.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryCoordinator::new();
        store.put("/nodes/a", b"one".to_vec()).await.unwrap();

        let kv = store.get("/nodes/a").await.unwrap().unwrap();
        assert_eq!(kv.value, b"one");

        assert!(store.delete("/nodes/a").await.unwrap());
        assert!(!store.delete("/nodes/a").await.unwrap());
        assert!(store.get("/nodes/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_if_absent_respects_live_keys() {
        let store = MemoryCoordinator::new();
        assert!(store
            .put_if_absent("/tokens/_init", b"a".to_vec(), None)
            .await
            .unwrap());
        assert!(!store
            .put_if_absent("/tokens/_init", b"b".to_vec(), None)
            .await
            .unwrap());
        let kv = store.get("/tokens/_init").await.unwrap().unwrap();
        assert_eq!(kv.value, b"a");
    }

    #[tokio::test]
    async fn test_ttl_key_expires() {
        let store = MemoryCoordinator::new();
        assert!(store
            .put_if_absent("/lease", b"x".to_vec(), Some(Duration::from_millis(30)))
            .await
            .unwrap());
        assert!(store.get("/lease").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("/lease").await.unwrap().is_none());
        // Expired keys count as absent for a new claimant.
        assert!(store
            .put_if_absent("/lease", b"y".to_vec(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryCoordinator::new();
        let rev = store.put("/item", b"v1".to_vec()).await.unwrap();

        assert!(store
            .compare_and_swap("/item", rev, b"v2".to_vec())
            .await
            .unwrap());
        // Stale revision loses.
        assert!(!store
            .compare_and_swap("/item", rev, b"v3".to_vec())
            .await
            .unwrap());
        let kv = store.get("/item").await.unwrap().unwrap();
        assert_eq!(kv.value, b"v2");
    }

    #[tokio::test]
    async fn test_watch_resumes_from_snapshot_revision() {
        let store = MemoryCoordinator::new();
        store.put("/w/a", b"1".to_vec()).await.unwrap();

        let snapshot = store.list("/w/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);

        // A write that lands between snapshot and watch registration
        // must still be delivered.
        store.put("/w/b", b"2".to_vec()).await.unwrap();

        let mut watch = store.watch_prefix("/w/", snapshot.revision).await.unwrap();
        store.delete("/w/a").await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.key(), "/w/b");
        let second = watch.recv().await.unwrap();
        assert!(matches!(second, WatchEvent::Delete { ref key, .. } if key == "/w/a"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = Arc::new(MemoryCoordinator::new());
        let guard = store.lock("/tokens/_lock", Duration::from_secs(10)).await.unwrap();

        let contender = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            contender
                .lock("/tokens/_lock", Duration::from_secs(10))
                .await
                .unwrap()
        });

        // The contender cannot acquire while we hold the lock.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!waiter.is_finished());

        store.unlock(guard).await.unwrap();
        let guard2 = waiter.await.unwrap();
        store.unlock(guard2).await.unwrap();
    }
}
