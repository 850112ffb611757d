//! etcd-backed coordination store
//!
//! Production implementation of [`CoordinationStore`] on top of etcd:
//! transactions give compare-and-set, native leases give TTL keys and
//! lock renewal, and watch streams are forwarded into the trait's
//! channel shape.

use super::{
    CoordinationConfig, CoordinationStore, KeyValue, LockGuard, Snapshot, WatchEvent,
    WATCH_CHANNEL_CAPACITY,
};
use crate::{Error, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LockOptions, PutOptions,
    Txn, TxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// etcd coordination store
///
/// The underlying client multiplexes one gRPC channel and is cheap to
/// clone; every call clones it rather than serializing on a mutex.
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to the given endpoints with the configured dial timeout.
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Config(
                "no etcd endpoints configured".to_string(),
            ));
        }
        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> i64 {
        header.map(|h| h.revision()).unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationStore for EtcdCoordinator {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).to_string(),
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.put(key, value, None).await?;
        Ok(Self::header_revision(resp.header()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
                revision: kv.mod_revision(),
            })
            .collect();
        Ok(Snapshot {
            kvs,
            revision: Self::header_revision(resp.header()),
        })
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut client = self.client.clone();
        let mut lease_id = None;
        let put_options = match ttl {
            Some(ttl) => {
                let grant = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
                lease_id = Some(grant.id());
                Some(PutOptions::new().with_lease(grant.id()))
            }
            None => None,
        };

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_options)]);
        let resp = client.txn(txn).await?;

        if !resp.succeeded() {
            // Lost the race; drop the now-useless lease.
            if let Some(id) = lease_id {
                if let Err(err) = client.lease_revoke(id).await {
                    debug!(lease = id, %err, "failed to revoke unused lease");
                }
            }
        }
        Ok(resp.succeeded())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: Vec<u8>,
    ) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_revision,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str, revision: i64) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        let prefix = prefix.to_string();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the stream;
            // dropping it cancels the server-side watch.
            let _watcher = watcher;
            loop {
                let message = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(prefix = %prefix, %err, "etcd watch stream failed");
                        break;
                    }
                };
                for event in message.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).to_string();
                    let mapped = match event.event_type() {
                        EventType::Put => WatchEvent::Put(KeyValue {
                            key,
                            value: kv.value().to_vec(),
                            revision: kv.mod_revision(),
                        }),
                        EventType::Delete => WatchEvent::Delete {
                            key,
                            revision: kv.mod_revision(),
                        },
                    };
                    if tx.send(mapped).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        let mut client = self.client.clone();
        let grant = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        let lease_id = grant.id();
        let resp = client
            .lock(key, Some(LockOptions::new().with_lease(lease_id)))
            .await?;
        let lock_key = resp.key().to_vec();

        // Keep the lease alive until unlock; a crashed holder stops
        // renewing and the lock falls back after the TTL.
        let renewal = CancellationToken::new();
        let renew_token = renewal.clone();
        let mut renew_client = self.client.clone();
        tokio::spawn(async move {
            let (mut keeper, mut responses) = match renew_client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(lease = lease_id, %err, "lease keep-alive setup failed");
                    return;
                }
            };
            let interval = ttl / 3;
            loop {
                tokio::select! {
                    _ = renew_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease = lease_id, %err, "lease keep-alive failed");
                    return;
                }
                if let Err(err) = responses.message().await {
                    warn!(lease = lease_id, %err, "lease keep-alive stream failed");
                    return;
                }
            }
        });

        Ok(LockGuard {
            name: key.to_string(),
            key: lock_key,
            lease: lease_id,
            renewal,
        })
    }

    async fn unlock(&self, guard: LockGuard) -> Result<()> {
        guard.renewal.cancel();
        let mut client = self.client.clone();
        client.unlock(guard.key).await?;
        if guard.lease != 0 {
            if let Err(err) = client.lease_revoke(guard.lease).await {
                debug!(lease = guard.lease, %err, "failed to revoke lock lease");
            }
        }
        Ok(())
    }
}
