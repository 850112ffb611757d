//! Reliable per-target work queue
//!
//! Long-running import and delete jobs are pushed as durable items
//! under `/workqueue/<target>/<id>` in the coordination store. Each
//! node runs one consumer for its own queue: it claims the oldest
//! runnable item by compare-and-set (Pending -> InFlight with a lease),
//! executes it, and deletes it on success. When a consumer crashes the
//! lease simply expires and the item becomes claimable again, giving
//! at-least-once execution. FIFO holds per target only.

use crate::coordination::{keys, CoordinationStore};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// What a work item asks its target to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    /// Import token data, then optionally take ownership
    Import,
    /// Drop local data for tokens no longer replicated here
    Delete,
}

/// Job parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPayload {
    /// Tokens this job is about
    pub tokens: Vec<u32>,
    /// Secondary tokens whose replicated data must come along;
    /// imported but never assigned
    #[serde(default)]
    pub followers: Vec<u32>,
    /// Fixed source endpoint; when unset the executor resolves a live
    /// replica per token at execution time
    #[serde(default)]
    pub source: Option<String>,
    /// Whether the target takes ownership of `tokens` after importing
    #[serde(default)]
    pub assign: bool,
}

/// A persisted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub target: String,
    pub kind: WorkKind,
    pub payload: WorkPayload,
    pub attempts: u32,
    pub state: WorkState,
    /// While InFlight, when the claim lapses
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Work queue tuning
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Claim lease; an item stuck InFlight past this is reclaimable
    pub lease_ttl: Duration,
    /// Attempts before an item is marked Failed for operators
    pub max_attempts: u32,
    /// Consumer poll interval
    pub poll_interval: Duration,
    /// Pause before releasing a failed item back to Pending
    pub retry_backoff: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Producer half: push durable jobs for any target
pub struct WorkQueue {
    store: Arc<dyn CoordinationStore>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn item_key(target: &str, id: &str) -> String {
        format!("{}{}/{}", keys::WORK_QUEUE, target, id)
    }

    /// Append a job for `target`. Returns once the store has
    /// acknowledged the write. Ids sort by push time, which is what
    /// gives the per-target FIFO.
    pub async fn push(&self, target: &str, kind: WorkKind, payload: WorkPayload) -> Result<String> {
        let id = format!(
            "{:020}-{}",
            Utc::now().timestamp_micros(),
            &Uuid::new_v4().to_string()[..8]
        );
        let item = WorkItem {
            id: id.clone(),
            target: target.to_string(),
            kind,
            payload,
            attempts: 0,
            state: WorkState::Pending,
            lease_expires_at: None,
        };
        self.store
            .put(&Self::item_key(target, &id), serde_json::to_vec(&item)?)
            .await?;
        info!(target, id = %id, kind = ?kind, "work item pushed");
        Ok(id)
    }

    /// All live items for a target, oldest first.
    pub async fn items(&self, target: &str) -> Result<Vec<WorkItem>> {
        let prefix = format!("{}{}/", keys::WORK_QUEUE, target);
        let snapshot = self.store.list(&prefix).await?;
        let mut items = Vec::with_capacity(snapshot.kvs.len());
        for kv in snapshot.kvs {
            match serde_json::from_slice::<WorkItem>(&kv.value) {
                Ok(item) => items.push(item),
                Err(err) => warn!(key = %kv.key, %err, "skipping unparseable work item"),
            }
        }
        Ok(items)
    }
}

/// Executes claimed work items
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<()>;
}

/// Consumer half: drains one node's queue
pub struct WorkQueueConsumer {
    store: Arc<dyn CoordinationStore>,
    node_name: String,
    handler: Arc<dyn WorkHandler>,
    config: WorkQueueConfig,
}

impl WorkQueueConsumer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        node_name: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
        config: WorkQueueConfig,
    ) -> Self {
        Self {
            store,
            node_name: node_name.into(),
            handler,
            config,
        }
    }

    /// Poll until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            loop {
                match self.run_once().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        warn!(%err, "work queue pass failed");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and execute at most one item. Returns whether an item was
    /// processed (or contended), so callers can drain in a loop.
    pub async fn run_once(&self) -> Result<bool> {
        let prefix = format!("{}{}/", keys::WORK_QUEUE, self.node_name);
        let snapshot = self.store.list(&prefix).await?;
        let now = Utc::now();

        for kv in snapshot.kvs {
            let item: WorkItem = match serde_json::from_slice(&kv.value) {
                Ok(item) => item,
                Err(err) => {
                    warn!(key = %kv.key, %err, "skipping unparseable work item");
                    continue;
                }
            };
            let claimable = match item.state {
                WorkState::Pending => true,
                WorkState::InFlight => item
                    .lease_expires_at
                    .map_or(true, |deadline| deadline <= now),
                WorkState::Done | WorkState::Failed => false,
            };
            if !claimable {
                continue;
            }

            // Claim by CAS; losing just means another pass claimed it.
            let mut claimed = item.clone();
            claimed.state = WorkState::InFlight;
            claimed.attempts += 1;
            claimed.lease_expires_at = Some(
                now + chrono::Duration::from_std(self.config.lease_ttl)
                    .unwrap_or(chrono::Duration::seconds(60)),
            );
            let won = self
                .store
                .compare_and_swap(&kv.key, kv.revision, serde_json::to_vec(&claimed)?)
                .await?;
            if !won {
                debug!(id = %item.id, "lost work item claim race");
                return Ok(true);
            }

            return self.execute_claimed(&kv.key, claimed).await.map(|_| true);
        }
        Ok(false)
    }

    async fn execute_claimed(&self, key: &str, mut item: WorkItem) -> Result<()> {
        info!(id = %item.id, kind = ?item.kind, attempt = item.attempts, "executing work item");
        match self.handler.execute(&item).await {
            Ok(()) => {
                // Done items are deleted rather than kept; the queue
                // holds only live and failed work.
                self.store.delete(key).await?;
                info!(id = %item.id, "work item done");
                Ok(())
            }
            Err(err) if item.attempts >= self.config.max_attempts => {
                error!(id = %item.id, attempts = item.attempts, %err,
                    "work item failed permanently, operator attention required");
                item.state = WorkState::Failed;
                item.lease_expires_at = None;
                self.store
                    .put(key, serde_json::to_vec(&item)?)
                    .await?;
                Ok(())
            }
            Err(err) => {
                warn!(id = %item.id, attempt = item.attempts, %err, "work item failed, will retry");
                tokio::time::sleep(self.config.retry_backoff).await;
                item.state = WorkState::Pending;
                item.lease_expires_at = None;
                self.store
                    .put(key, serde_json::to_vec(&item)?)
                    .await?;
                Ok(())
            }
        }
    }
}
