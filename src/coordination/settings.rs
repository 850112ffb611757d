//! Cluster-wide settings
//!
//! Settings live under `/settings/` in the coordination store so every
//! node converges on the same values. Today that is just the default
//! replication factor; the resolver follows changes via a watch.

use super::{keys, CoordinationStore, WatchEvent};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Replication factor used when the setting has never been written.
pub const DEFAULT_REPLICATION_FACTOR: usize = 2;

/// Typed access to cluster settings
pub struct SettingsStore {
    store: Arc<dyn CoordinationStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Current default replication factor.
    pub async fn replication_factor(&self) -> Result<usize> {
        match self.store.get(keys::REPLICATION_FACTOR).await? {
            Some(kv) => Ok(parse_factor(&kv.value).unwrap_or(DEFAULT_REPLICATION_FACTOR)),
            None => Ok(DEFAULT_REPLICATION_FACTOR),
        }
    }

    pub async fn set_replication_factor(&self, factor: usize) -> Result<()> {
        self.store
            .put(keys::REPLICATION_FACTOR, factor.to_string().into_bytes())
            .await?;
        Ok(())
    }

    /// Stream of replication factor changes. Deleting the setting
    /// reverts to the default.
    pub async fn watch_replication_factor(&self) -> Result<mpsc::Receiver<usize>> {
        let snapshot = self.store.list(keys::REPLICATION_FACTOR).await?;
        let mut events = self
            .store
            .watch_prefix(keys::REPLICATION_FACTOR, snapshot.revision)
            .await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let factor = match event {
                    WatchEvent::Put(kv) => match parse_factor(&kv.value) {
                        Some(factor) => factor,
                        None => {
                            warn!("ignoring unparseable replication factor setting");
                            continue;
                        }
                    },
                    WatchEvent::Delete { .. } => DEFAULT_REPLICATION_FACTOR,
                };
                if tx.send(factor).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn parse_factor(raw: &[u8]) -> Option<usize> {
    std::str::from_utf8(raw)
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|f| *f > 0)
}
