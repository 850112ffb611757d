//! Join and node-removal rebalancing
//!
//! A join steals tokens from incumbents under the registry lock:
//! reserve, import primary data, take ownership, then import the
//! replicated data that follows the stolen primaries. The sequence is
//! crash-safe: any failure leaves the node in Recovering with only
//! expiring reservations held, so a retry is safe. Data orphaned on
//! old primaries is deleted through the work queue, never
//! synchronously.

use super::importer::Importer;
use super::work_queue::{WorkHandler, WorkItem, WorkKind, WorkPayload, WorkQueue};
use crate::cluster::{
    nodes, Node, NodeCollection, NodeStatus, ResolveMode, Resolver, TokenRegistry,
};
use crate::coordination::CoordinationStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// How a join concluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First node in the cluster; seeded the token set
    Bootstrapped,
    /// Joined an existing cluster, stealing these tokens
    Joined { stolen: Vec<u32> },
}

/// Runs the join sequence and node-removal redistribution for one node
pub struct JoinProtocol {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<TokenRegistry>,
    resolver: Arc<Resolver>,
    nodes: Arc<NodeCollection>,
    importer: Arc<dyn Importer>,
    work_queue: Arc<WorkQueue>,
    local_name: String,
    data_location: String,
    initial_tokens: usize,
}

impl JoinProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<TokenRegistry>,
        resolver: Arc<Resolver>,
        nodes: Arc<NodeCollection>,
        importer: Arc<dyn Importer>,
        work_queue: Arc<WorkQueue>,
        local_name: impl Into<String>,
        data_location: impl Into<String>,
        initial_tokens: usize,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            nodes,
            importer,
            work_queue,
            local_name: local_name.into(),
            data_location: data_location.into(),
            initial_tokens,
        }
    }

    /// Run the join under the registry lock. Only one join proceeds at
    /// a time cluster-wide.
    pub async fn run(&self) -> Result<JoinOutcome> {
        let guard = self.registry.lock().await?;
        let outcome = self.run_locked().await;
        if let Err(err) = self.registry.unlock(guard).await {
            warn!(%err, "failed to release registry lock");
        }
        outcome
    }

    async fn run_locked(&self) -> Result<JoinOutcome> {
        if self
            .registry
            .init_many(&self.local_name, self.initial_tokens)
            .await?
        {
            // Bootstrap: the ring sync will replay the seeded tokens,
            // but apply them directly so this node routes immediately.
            for (token, owner) in self.registry.get().await? {
                self.resolver.add_token(token, &owner);
            }
            self.set_status(NodeStatus::Up).await?;
            info!(node = %self.local_name, tokens = self.initial_tokens, "bootstrapped cluster");
            return Ok(JoinOutcome::Bootstrapped);
        }

        info!(node = %self.local_name, "joining existing cluster");
        // Recovering blocks writes to us until the imports finish.
        self.set_status(NodeStatus::Recovering).await?;

        // The lock freezes the registry, so reconcile the local ring
        // with it now: the steal computation below must see the
        // authoritative topology, not a lagging watch.
        self.resolver.replace_ring(&self.registry.get().await?);

        let candidates = self.registry.suggest_reservations().await?;
        let mut reserved = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.registry.reserve(candidate, &self.local_name).await? {
                reserved.push(candidate);
            }
        }
        if reserved.is_empty() {
            // Nothing to steal (tiny cluster or every candidate was
            // contested); the node is still a valid member.
            self.set_status(NodeStatus::Up).await?;
            return Ok(JoinOutcome::Joined { stolen: reserved });
        }
        info!(node = %self.local_name, tokens = ?reserved, "reserved tokens to steal");

        // Import primary data from the current owners.
        for (source, tokens) in self.group_by_primary(&reserved)? {
            self.importer.import(&tokens, &source).await?;
        }

        // Take ownership. The resolver must learn each assignment
        // before the reverse-secondary computation below, which depends
        // on the new topology.
        let mut old_primaries: HashMap<u32, String> = HashMap::new();
        for &token in &reserved {
            if let Some(primary) = self.resolver.find_primary(token) {
                old_primaries.insert(token, primary);
            }
            self.registry.release(token).await?;
            self.registry.assign(token, &self.local_name).await?;
            self.resolver.add_token(token, &self.local_name);
        }

        // Replicated data that now follows the stolen primaries here.
        let secondary_tokens: BTreeSet<u32> = reserved
            .iter()
            .flat_map(|&token| self.resolver.reverse_secondary_lookup(token))
            .collect();
        if !secondary_tokens.is_empty() {
            info!(count = secondary_tokens.len(), "importing replicated data");
            let secondary: Vec<u32> = secondary_tokens.into_iter().collect();
            for (source, tokens) in self.group_by_primary(&secondary)? {
                self.importer.import(&tokens, &source).await?;
            }
        }

        // Old primaries that fell out of a token's replica list no
        // longer need its data. Deletion goes through the work queue;
        // until it drains, the orphaned data is harmless because the
        // resolver no longer routes to it.
        for (&token, old_primary) in &old_primaries {
            if *old_primary == self.local_name {
                continue;
            }
            let still_replica = self
                .resolver
                .resolve(token, ResolveMode::Write)
                .iter()
                .any(|replica| replica.node == *old_primary);
            if !still_replica {
                self.work_queue
                    .push(
                        old_primary,
                        WorkKind::Delete,
                        WorkPayload {
                            tokens: vec![token],
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        self.set_status(NodeStatus::Up).await?;
        reserved.sort_unstable();
        info!(node = %self.local_name, stolen = reserved.len(), "join finished");
        Ok(JoinOutcome::Joined { stolen: reserved })
    }

    /// Redistribute a removed node's tokens round-robin over the
    /// surviving Up nodes, each import job carrying the tokens plus
    /// their reverse-secondary followers. Receivers drain the queue
    /// themselves.
    pub async fn redistribute_removed(&self, removed: &Node) -> Result<()> {
        let mut survivors: Vec<String> = self
            .nodes
            .get_all()
            .into_values()
            .filter(|node| node.name != removed.name && node.status == NodeStatus::Up)
            .map(|node| node.name)
            .collect();
        survivors.sort_unstable();
        if survivors.is_empty() {
            warn!(removed = %removed.name, "no surviving nodes to take over tokens");
            return Ok(());
        }

        let assignments = self.registry.get().await?;
        let mut orphaned: Vec<u32> = assignments
            .iter()
            .filter(|(_, owner)| **owner == removed.name)
            .map(|(token, _)| *token)
            .collect();
        orphaned.sort_unstable();

        let mut groups: BTreeMap<String, (Vec<u32>, BTreeSet<u32>)> = BTreeMap::new();
        for (i, token) in orphaned.iter().enumerate() {
            let receiver = &survivors[i % survivors.len()];
            let (primaries, followers) = groups.entry(receiver.clone()).or_default();
            primaries.push(*token);
            followers.extend(self.resolver.reverse_secondary_lookup(*token));
        }

        for (receiver, (primaries, followers)) in groups {
            let followers: Vec<u32> = followers
                .into_iter()
                .filter(|token| !primaries.contains(token))
                .collect();
            self.work_queue
                .push(
                    &receiver,
                    WorkKind::Import,
                    WorkPayload {
                        tokens: primaries,
                        followers,
                        source: None,
                        assign: true,
                    },
                )
                .await?;
        }
        info!(removed = %removed.name, tokens = orphaned.len(), "redistribution jobs enqueued");
        Ok(())
    }

    /// Group tokens by the data endpoint of their current primary.
    fn group_by_primary(&self, tokens: &[u32]) -> Result<BTreeMap<String, Vec<u32>>> {
        let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for &token in tokens {
            let owner = self
                .resolver
                .find_primary(token)
                .ok_or_else(|| Error::Import(format!("token {token} has no primary")))?;
            let endpoint = self
                .nodes
                .get(&owner)
                .map(|node| node.data_location)
                .filter(|loc| !loc.is_empty())
                .ok_or_else(|| Error::Import(format!("no data endpoint for node {owner}")))?;
            if endpoint == self.data_location {
                continue;
            }
            groups.entry(endpoint).or_default().push(token);
        }
        Ok(groups)
    }

    async fn set_status(&self, status: NodeStatus) -> Result<()> {
        let mut node = nodes::load_node(self.store.as_ref(), &self.local_name)
            .await?
            .unwrap_or_else(|| Node::new(&self.local_name, &self.data_location));
        node.data_location = self.data_location.clone();
        node.status = status;
        // Refresh the cached token set; the registry stays authoritative.
        node.tokens = self.resolver.tokens_of(&self.local_name);
        nodes::save_node(self.store.as_ref(), &node).await
    }
}

/// Executes the durable import/delete jobs a node receives through the
/// work queue. Import jobs resolve a live source per token at execution
/// time, pull the data, and take ownership when the job says so.
pub struct ReliableImportHandler {
    registry: Arc<TokenRegistry>,
    resolver: Arc<Resolver>,
    nodes: Arc<NodeCollection>,
    importer: Arc<dyn Importer>,
    local_name: String,
    data_location: String,
}

impl ReliableImportHandler {
    pub fn new(
        registry: Arc<TokenRegistry>,
        resolver: Arc<Resolver>,
        nodes: Arc<NodeCollection>,
        importer: Arc<dyn Importer>,
        local_name: impl Into<String>,
        data_location: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            resolver,
            nodes,
            importer,
            local_name: local_name.into(),
            data_location: data_location.into(),
        }
    }

    /// A live replica endpoint for `token` other than ourselves.
    fn source_for(&self, token: u32) -> Result<String> {
        self.resolver
            .resolve(token, ResolveMode::Read)
            .into_iter()
            .find(|replica| {
                replica.node != self.local_name
                    && !replica.data_location.is_empty()
                    && self
                        .nodes
                        .get(&replica.node)
                        .is_some_and(|node| node.status == NodeStatus::Up)
            })
            .map(|replica| replica.data_location)
            .ok_or_else(|| Error::Import(format!("no live replica for token {token}")))
    }

    async fn execute_import(&self, item: &WorkItem) -> Result<()> {
        let all_tokens: Vec<u32> = item
            .payload
            .tokens
            .iter()
            .chain(item.payload.followers.iter())
            .copied()
            .collect();

        let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        match &item.payload.source {
            Some(source) => {
                groups.insert(source.clone(), all_tokens);
            }
            None => {
                for token in all_tokens {
                    // A node already in the token's replica list holds
                    // its data; nothing to pull.
                    let replicas = self.resolver.resolve(token, ResolveMode::Read);
                    if replicas.iter().any(|replica| replica.node == self.local_name) {
                        continue;
                    }
                    groups.entry(self.source_for(token)?).or_default().push(token);
                }
            }
        }
        for (source, tokens) in groups {
            if source == self.data_location {
                continue;
            }
            self.importer.import(&tokens, &source).await?;
        }

        if item.payload.assign {
            for &token in &item.payload.tokens {
                self.registry.assign(token, &self.local_name).await?;
                self.resolver.add_token(token, &self.local_name);
            }
        }
        Ok(())
    }

    async fn execute_delete(&self, item: &WorkItem) -> Result<()> {
        for &token in &item.payload.tokens {
            self.importer.delete(token).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkHandler for ReliableImportHandler {
    async fn execute(&self, item: &WorkItem) -> Result<()> {
        match item.kind {
            WorkKind::Import => self.execute_import(item).await,
            WorkKind::Delete => self.execute_delete(item).await,
        }
    }
}
