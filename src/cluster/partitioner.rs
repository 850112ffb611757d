//! Partition key declarations and token computation
//!
//! A partition key declares which tags of which measurement determine a
//! record's token. The partitioner hashes the record's tag values, in
//! declared order, to a token on the ring. Declarations persist in the
//! coordination store so every proxy computes identical tokens.

use super::TOKEN_RANGE;
use crate::coordination::{keys, CoordinationStore, WatchEvent};
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token used for records whose measurement has no partition key.
pub const DEFAULT_SHARD_TOKEN: u32 = 0;

/// Separator between tag values in the hash input. Tag values must
/// never contain it; they are rejected up front.
const TAG_SEPARATOR: u8 = 0;

const RESYNC_BACKOFF: Duration = Duration::from_secs(2);

/// Declaration of which tags partition a measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKey {
    pub database: String,
    pub measurement: String,
    /// Tag names in hashing order
    pub tags: Vec<String>,
}

impl PartitionKey {
    fn storage_key(&self) -> String {
        format!("{}{}/{}", keys::PARTITIONS, self.database, self.measurement)
    }

    fn validate(&self) -> Result<()> {
        if self.database.is_empty() || self.measurement.is_empty() || self.tags.is_empty() {
            return Err(Error::Config(
                "partition key needs a database, a measurement and at least one tag".to_string(),
            ));
        }
        for field in [&self.database, &self.measurement]
            .into_iter()
            .chain(self.tags.iter())
        {
            if field.bytes().any(|b| b == TAG_SEPARATOR) {
                return Err(Error::InvalidTagValue(field.clone()));
            }
        }
        Ok(())
    }
}

/// Maps (database, measurement, tag values) to partition tokens
pub struct Partitioner {
    declarations: DashMap<(String, String), PartitionKey>,
    store: Option<Arc<dyn CoordinationStore>>,
}

impl Partitioner {
    /// A partitioner that only knows locally added keys.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            declarations: DashMap::new(),
            store: None,
        })
    }

    /// A partitioner synced from `/partitions/` in the store. Runs a
    /// watch task until cancelled.
    pub async fn synced(
        store: Arc<dyn CoordinationStore>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let partitioner = Arc::new(Self {
            declarations: DashMap::new(),
            store: Some(Arc::clone(&store)),
        });

        let snapshot = store.list(keys::PARTITIONS).await?;
        for kv in &snapshot.kvs {
            partitioner.load(&kv.value);
        }

        let sync = Arc::clone(&partitioner);
        let mut revision = snapshot.revision;
        tokio::spawn(async move {
            loop {
                let mut events = match store.watch_prefix(keys::PARTITIONS, revision).await {
                    Ok(events) => events,
                    Err(err) => {
                        warn!(%err, "partition key watch failed, retrying");
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
                                revision = revision.max(kv.revision);
                                sync.load(&kv.value);
                            }
                            Some(WatchEvent::Delete { key, revision: rev }) => {
                                revision = revision.max(rev);
                                sync.unload(&key);
                            }
                            None => break,
                        },
                    }
                }
                warn!("partition key watch closed, re-establishing");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESYNC_BACKOFF) => {}
                }
            }
        });

        Ok(partitioner)
    }

    fn load(&self, raw: &[u8]) {
        match serde_json::from_slice::<PartitionKey>(raw) {
            Ok(key) => {
                debug!(db = %key.database, measurement = %key.measurement, "partition key loaded");
                self.declarations
                    .insert((key.database.clone(), key.measurement.clone()), key);
            }
            Err(err) => warn!(%err, "skipping unparseable partition key"),
        }
    }

    fn unload(&self, storage_key: &str) {
        let rest = storage_key.trim_start_matches(keys::PARTITIONS);
        if let Some((db, measurement)) = rest.split_once('/') {
            self.declarations
                .remove(&(db.to_string(), measurement.to_string()));
        }
    }

    /// Register a partition key, persisting it when a store is attached.
    pub async fn add_key(&self, key: PartitionKey) -> Result<()> {
        key.validate()?;
        if let Some(store) = &self.store {
            store
                .put(&key.storage_key(), serde_json::to_vec(&key)?)
                .await?;
        }
        self.declarations
            .insert((key.database.clone(), key.measurement.clone()), key);
        Ok(())
    }

    /// Compute the token for a record. Returns `Ok(None)` when no
    /// partition key is declared for (database, measurement); the
    /// caller routes those to [`DEFAULT_SHARD_TOKEN`]. A declared tag
    /// missing from the record hashes as the empty string.
    pub fn get_token(
        &self,
        database: &str,
        measurement: &str,
        tag_values: &HashMap<String, String>,
    ) -> Result<Option<u32>> {
        let declaration = match self
            .declarations
            .get(&(database.to_string(), measurement.to_string()))
        {
            Some(declaration) => declaration,
            None => return Ok(None),
        };

        let mut input = Vec::new();
        for (i, tag) in declaration.tags.iter().enumerate() {
            if i > 0 {
                input.push(TAG_SEPARATOR);
            }
            if let Some(value) = tag_values.get(tag) {
                if value.bytes().any(|b| b == TAG_SEPARATOR) {
                    return Err(Error::InvalidTagValue(tag.clone()));
                }
                input.extend_from_slice(value.as_bytes());
            }
        }
        Ok(Some(crc32fast::hash(&input) % TOKEN_RANGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sharded_key() -> PartitionKey {
        PartitionKey {
            database: "sharded".to_string(),
            measurement: "treasures".to_string(),
            tags: vec!["type".to_string()],
        }
    }

    #[tokio::test]
    async fn test_token_is_stable_and_in_range() {
        let partitioner = Partitioner::new();
        partitioner.add_key(sharded_key()).await.unwrap();

        let lookup = tags(&[("type", "gold")]);
        let first = partitioner
            .get_token("sharded", "treasures", &lookup)
            .unwrap()
            .unwrap();
        let second = partitioner
            .get_token("sharded", "treasures", &lookup)
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert!(first < TOKEN_RANGE);
    }

    #[tokio::test]
    async fn test_unknown_measurement_returns_none() {
        let partitioner = Partitioner::new();
        partitioner.add_key(sharded_key()).await.unwrap();

        let token = partitioner
            .get_token("sharded", "unknown", &tags(&[("type", "gold")]))
            .unwrap();
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn test_tag_order_matters() {
        let partitioner = Partitioner::new();
        partitioner
            .add_key(PartitionKey {
                database: "db".to_string(),
                measurement: "m".to_string(),
                tags: vec!["host".to_string(), "region".to_string()],
            })
            .await
            .unwrap();

        let ab = partitioner
            .get_token("db", "m", &tags(&[("host", "a"), ("region", "b")]))
            .unwrap()
            .unwrap();
        let ba = partitioner
            .get_token("db", "m", &tags(&[("host", "b"), ("region", "a")]))
            .unwrap()
            .unwrap();
        assert_ne!(ab, ba);
    }

    #[tokio::test]
    async fn test_nul_in_tag_value_is_rejected() {
        let partitioner = Partitioner::new();
        partitioner.add_key(sharded_key()).await.unwrap();

        let err = partitioner
            .get_token("sharded", "treasures", &tags(&[("type", "go\0ld")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTagValue(_)));
    }

    #[tokio::test]
    async fn test_nul_in_declaration_is_rejected() {
        let partitioner = Partitioner::new();
        let err = partitioner
            .add_key(PartitionKey {
                database: "db".to_string(),
                measurement: "m\0easure".to_string(),
                tags: vec!["t".to_string()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTagValue(_)));
    }

    #[tokio::test]
    async fn test_synced_partitioner_reloads_from_store() {
        use crate::coordination::MemoryCoordinator;

        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let cancel = CancellationToken::new();
        let writer = Partitioner::synced(Arc::clone(&store), cancel.clone())
            .await
            .unwrap();
        let reader = Partitioner::synced(Arc::clone(&store), cancel.clone())
            .await
            .unwrap();

        writer.add_key(sharded_key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lookup = tags(&[("type", "gold")]);
        let from_writer = writer.get_token("sharded", "treasures", &lookup).unwrap();
        let from_reader = reader.get_token("sharded", "treasures", &lookup).unwrap();
        assert!(from_writer.is_some());
        assert_eq!(from_writer, from_reader);
        cancel.cancel();
    }
}
