//! Gossip overlay for low-latency liveness
//!
//! Between coordination-store updates, nodes learn about each other
//! through periodic UDP heartbeats carrying each member's metadata
//! (name, tokens, status). The overlay is advisory: the token registry
//! stays authoritative, and on any disagreement the registry wins on
//! the next watch tick. Join, leave and update events fan out per-token
//! notifications to a registered observer list.

use super::node::NodeStatus;
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gossip overlay configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    /// How often the local metadata is broadcast
    pub heartbeat_interval: Duration,
    /// Silence after which a member is declared gone
    pub suspicion_timeout: Duration,
    /// Whether a member's tokens are reported removed as soon as it
    /// goes silent, or only when the registry says so
    pub remove_tokens_on_leave: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 18086,
            heartbeat_interval: Duration::from_secs(1),
            suspicion_timeout: Duration::from_secs(5),
            remove_tokens_on_leave: true,
        }
    }
}

/// Metadata each member broadcasts about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub name: String,
    pub tokens: Vec<u32>,
    pub status: NodeStatus,
}

/// Per-token membership notifications
pub trait TokenObserver: Send + Sync {
    fn token_added(&self, token: u32, node: &str);
    fn token_removed(&self, token: u32, node: &str);
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    Heartbeat(NodeMeta),
    /// Graceful departure; reaped members produce the same effect late
    Leave { name: String },
}

struct Member {
    meta: NodeMeta,
    addr: SocketAddr,
    last_seen: Instant,
}

/// UDP gossip overlay
pub struct Gossip {
    config: GossipConfig,
    socket: Arc<UdpSocket>,
    local: RwLock<NodeMeta>,
    members: DashMap<String, Member>,
    observers: RwLock<Vec<Arc<dyn TokenObserver>>>,
}

impl Gossip {
    /// Bind the overlay socket and prepare to gossip `local`.
    pub async fn bind(config: GossipConfig, local: NodeMeta) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((config.bind_addr.as_str(), config.bind_port)).await?;
        info!(addr = %socket.local_addr()?, "gossip overlay listening");
        Ok(Arc::new(Self {
            config,
            socket: Arc::new(socket),
            local: RwLock::new(local),
            members: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }))
    }

    pub fn register_observer(&self, observer: Arc<dyn TokenObserver>) {
        self.observers.write().push(observer);
    }

    /// Replace the local metadata carried by subsequent heartbeats.
    pub fn update_local(&self, meta: NodeMeta) {
        *self.local.write() = meta;
    }

    /// Currently known live members, not counting the local node.
    pub fn members(&self) -> Vec<NodeMeta> {
        self.members.iter().map(|m| m.meta.clone()).collect()
    }

    /// Contact seed members so they learn about us on the next tick.
    pub async fn join(&self, seeds: &[String]) -> Result<()> {
        let payload = serde_json::to_vec(&GossipMessage::Heartbeat(self.local.read().clone()))?;
        for seed in seeds {
            if seed.is_empty() {
                continue;
            }
            if let Err(err) = self.socket.send_to(&payload, seed.as_str()).await {
                warn!(seed = %seed, %err, "failed to contact gossip seed");
            }
        }
        Ok(())
    }

    /// Drive the overlay: receive heartbeats, broadcast our own, and
    /// reap members that have gone silent.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = heartbeat.tick() => {
                    self.broadcast().await;
                    self.reap();
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buffer[..len], addr),
                    Err(err) => warn!(%err, "gossip receive failed"),
                },
            }
        }
    }

    async fn broadcast(&self) {
        let payload = match serde_json::to_vec(&GossipMessage::Heartbeat(self.local.read().clone()))
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode heartbeat");
                return;
            }
        };
        let peers: Vec<SocketAddr> = self.members.iter().map(|m| m.addr).collect();
        for addr in peers {
            if let Err(err) = self.socket.send_to(&payload, addr).await {
                debug!(peer = %addr, %err, "heartbeat send failed");
            }
        }
    }

    fn handle_datagram(&self, raw: &[u8], from: SocketAddr) {
        let message: GossipMessage = match serde_json::from_slice(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %from, %err, "ignoring malformed gossip datagram");
                return;
            }
        };
        match message {
            GossipMessage::Heartbeat(meta) => self.apply_heartbeat(meta, from),
            GossipMessage::Leave { name } => self.remove_member(&name),
        }
    }

    fn apply_heartbeat(&self, meta: NodeMeta, from: SocketAddr) {
        if meta.name == self.local.read().name {
            return;
        }
        match self.members.entry(meta.name.clone()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(member = %meta.name, tokens = meta.tokens.len(), "gossip member joined");
                let tokens = meta.tokens.clone();
                entry.insert(Member {
                    meta: meta.clone(),
                    addr: from,
                    last_seen: Instant::now(),
                });
                for token in tokens {
                    self.notify_added(token, &meta.name);
                }
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let member = entry.get_mut();
                let (removed, added) = diff_tokens(&member.meta.tokens, &meta.tokens);
                member.meta = meta.clone();
                member.addr = from;
                member.last_seen = Instant::now();
                drop(entry);
                for token in removed {
                    self.notify_removed(token, &meta.name);
                }
                for token in added {
                    self.notify_added(token, &meta.name);
                }
            }
        }
    }

    fn reap(&self) {
        let deadline = self.config.suspicion_timeout;
        let silent: Vec<String> = self
            .members
            .iter()
            .filter(|m| m.last_seen.elapsed() > deadline)
            .map(|m| m.meta.name.clone())
            .collect();
        for name in silent {
            warn!(member = %name, "gossip member went silent");
            self.remove_member(&name);
        }
    }

    fn remove_member(&self, name: &str) {
        if let Some((_, mut member)) = self.members.remove(name) {
            member.meta.status = NodeStatus::Removed;
            if self.config.remove_tokens_on_leave {
                for token in &member.meta.tokens {
                    self.notify_removed(*token, name);
                }
            }
            info!(member = %name, "gossip member left");
        }
    }

    fn notify_added(&self, token: u32, node: &str) {
        for observer in self.observers.read().iter() {
            observer.token_added(token, node);
        }
    }

    fn notify_removed(&self, token: u32, node: &str) {
        for observer in self.observers.read().iter() {
            observer.token_removed(token, node);
        }
    }
}

/// Symmetric difference of two token sets: tokens only in `old` are
/// removed, tokens only in `new` are added. Order-insensitive.
pub fn diff_tokens(old: &[u32], new: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let old_set: std::collections::HashSet<u32> = old.iter().copied().collect();
    let new_set: std::collections::HashSet<u32> = new.iter().copied().collect();
    let mut removed: Vec<u32> = old.iter().copied().filter(|t| !new_set.contains(t)).collect();
    let mut added: Vec<u32> = new.iter().copied().filter(|t| !old_set.contains(t)).collect();
    removed.dedup();
    added.dedup();
    (removed, added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        added: Mutex<Vec<(u32, String)>>,
        removed: Mutex<Vec<(u32, String)>>,
    }

    impl TokenObserver for RecordingObserver {
        fn token_added(&self, token: u32, node: &str) {
            self.added.lock().push((token, node.to_string()));
        }
        fn token_removed(&self, token: u32, node: &str) {
            self.removed.lock().push((token, node.to_string()));
        }
    }

    #[test]
    fn test_diff_tokens_intended_semantics() {
        // An unchanged token set yields no notifications at all; the
        // historical failure mode here was reporting every token as
        // removed on each update.
        let (removed, added) = diff_tokens(&[1, 2, 3], &[1, 2, 3]);
        assert!(removed.is_empty());
        assert!(added.is_empty());

        let (removed, added) = diff_tokens(&[1, 2, 3], &[2, 3, 4]);
        assert_eq!(removed, vec![1]);
        assert_eq!(added, vec![4]);

        let (removed, added) = diff_tokens(&[], &[7]);
        assert!(removed.is_empty());
        assert_eq!(added, vec![7]);
    }

    fn test_gossip(config: GossipConfig) -> Gossip {
        // Handlers under test never touch the socket; bind lazily via
        // a std socket wrapped for the struct.
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        Gossip {
            config,
            socket: Arc::new(UdpSocket::from_std(std_socket).unwrap()),
            local: RwLock::new(NodeMeta {
                name: "local".to_string(),
                tokens: vec![],
                status: NodeStatus::Up,
            }),
            members: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_join_update_leave_notifications() {
        let gossip = test_gossip(GossipConfig::default());
        let observer = Arc::new(RecordingObserver::default());
        gossip.register_observer(Arc::clone(&observer) as Arc<dyn TokenObserver>);

        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        gossip.apply_heartbeat(
            NodeMeta {
                name: "peer".to_string(),
                tokens: vec![10, 20],
                status: NodeStatus::Up,
            },
            addr,
        );
        assert_eq!(
            observer.added.lock().clone(),
            vec![(10, "peer".to_string()), (20, "peer".to_string())]
        );

        // Update: one token traded for another.
        gossip.apply_heartbeat(
            NodeMeta {
                name: "peer".to_string(),
                tokens: vec![20, 30],
                status: NodeStatus::Up,
            },
            addr,
        );
        assert_eq!(observer.removed.lock().clone(), vec![(10, "peer".to_string())]);
        assert_eq!(observer.added.lock().last().unwrap(), &(30, "peer".to_string()));

        // Leave: remaining tokens reported removed.
        gossip.remove_member("peer");
        assert_eq!(
            observer.removed.lock().clone(),
            vec![
                (10, "peer".to_string()),
                (20, "peer".to_string()),
                (30, "peer".to_string())
            ]
        );
        assert!(gossip.members().is_empty());
    }

    #[tokio::test]
    async fn test_leave_keeps_tokens_when_configured() {
        let gossip = test_gossip(GossipConfig {
            remove_tokens_on_leave: false,
            ..Default::default()
        });
        let observer = Arc::new(RecordingObserver::default());
        gossip.register_observer(Arc::clone(&observer) as Arc<dyn TokenObserver>);

        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        gossip.apply_heartbeat(
            NodeMeta {
                name: "peer".to_string(),
                tokens: vec![10],
                status: NodeStatus::Up,
            },
            addr,
        );
        gossip.remove_member("peer");
        // Token removal is left to the registry watch.
        assert!(observer.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_own_heartbeat_is_ignored() {
        let gossip = test_gossip(GossipConfig::default());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        gossip.apply_heartbeat(
            NodeMeta {
                name: "local".to_string(),
                tokens: vec![1],
                status: NodeStatus::Up,
            },
            addr,
        );
        assert!(gossip.members().is_empty());
    }

    #[tokio::test]
    async fn test_two_overlays_exchange_heartbeats() {
        let meta_a = NodeMeta {
            name: "a".to_string(),
            tokens: vec![1, 2],
            status: NodeStatus::Up,
        };
        let meta_b = NodeMeta {
            name: "b".to_string(),
            tokens: vec![3],
            status: NodeStatus::Up,
        };
        let config = |port| GossipConfig {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: port,
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let gossip_a = Gossip::bind(config(0), meta_a).await.unwrap();
        let gossip_b = Gossip::bind(config(0), meta_b).await.unwrap();
        let addr_a = gossip_a.socket.local_addr().unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&gossip_a).run(cancel.clone()));
        tokio::spawn(Arc::clone(&gossip_b).run(cancel.clone()));

        gossip_b.join(&[addr_a.to_string()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(gossip_a.members().iter().any(|m| m.name == "b"));
        assert!(gossip_b.members().iter().any(|m| m.name == "a"));
        cancel.cancel();
    }
}
