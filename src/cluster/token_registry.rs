//! Persistent token ownership
//!
//! The registry is the authoritative record of which node owns each
//! partition token, kept under `/tokens/` in the coordination store.
//! Joins serialize on a distributed lock, steal candidates through
//! short-lived reservations, and commit ownership with unconditional
//! assigns. Every mutation publishes a watch event that the resolver
//! sync replays into the ring.

use super::{ClusterConfig, TOKEN_RANGE};
use crate::coordination::{keys, CoordinationStore, LockGuard};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

pub struct TokenRegistry {
    store: Arc<dyn CoordinationStore>,
    config: ClusterConfig,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ClusterConfig) -> Self {
        Self { store, config }
    }

    fn token_key(token: u32) -> String {
        format!("{}{}", keys::TOKENS, token)
    }

    fn reservation_key(token: u32) -> String {
        format!("{}{}", keys::TOKENS_RESERVED, token)
    }

    /// Full snapshot of token -> owner.
    pub async fn get(&self) -> Result<HashMap<u32, String>> {
        let snapshot = self.store.list(keys::TOKENS).await?;
        let mut assignments = HashMap::new();
        for kv in snapshot.kvs {
            if let Some(token) = kv.key.strip_prefix(keys::TOKENS).and_then(|k| k.parse().ok()) {
                assignments.insert(token, String::from_utf8_lossy(&kv.value).to_string());
            }
        }
        Ok(assignments)
    }

    /// Seed the token set if the registry is empty: `count` tokens
    /// spaced evenly around the token range, all owned by `owner`.
    /// Returns true for the bootstrap node, false for everyone else.
    /// First-node races are settled by a compare-and-set on the init
    /// marker; exactly one caller ever seeds.
    pub async fn init_many(&self, owner: &str, count: usize) -> Result<bool> {
        if count == 0 || count as u64 > u64::from(TOKEN_RANGE) {
            return Err(Error::Config(format!("invalid token count {count}")));
        }
        let won = self
            .store
            .put_if_absent(keys::TOKENS_INIT, owner.as_bytes().to_vec(), None)
            .await?;
        if !won {
            return Ok(false);
        }

        let spacing = TOKEN_RANGE / count as u32;
        for i in 0..count as u32 {
            let token = i * spacing;
            let created = self
                .store
                .put_if_absent(&Self::token_key(token), owner.as_bytes().to_vec(), None)
                .await?;
            if !created {
                // A token existing in an unseeded registry means the
                // store contents are corrupt.
                return Err(Error::TokenConflict(token));
            }
        }
        info!(owner, count, "seeded token registry");
        Ok(true)
    }

    /// Deterministic steal candidates for a joining node: one token at
    /// a time from whichever owner currently holds the most, until the
    /// joiner would reach the post-join fair share. Ties go to the
    /// lexicographically smallest owner name, so every node computes
    /// the same answer from the same snapshot.
    pub async fn suggest_reservations(&self) -> Result<Vec<u32>> {
        let assignments = self.get().await?;
        let mut by_owner: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (token, owner) in &assignments {
            by_owner.entry(owner.clone()).or_default().push(*token);
        }
        for tokens in by_owner.values_mut() {
            tokens.sort_unstable();
        }

        if by_owner.is_empty() {
            return Ok(Vec::new());
        }
        let fair_share = assignments.len() / (by_owner.len() + 1);
        let mut suggested = Vec::with_capacity(fair_share);
        while suggested.len() < fair_share {
            let heaviest = by_owner
                .iter()
                .filter(|(_, tokens)| !tokens.is_empty())
                .max_by(|(a_name, a_tokens), (b_name, b_tokens)| {
                    a_tokens
                        .len()
                        .cmp(&b_tokens.len())
                        .then(b_name.cmp(a_name))
                })
                .map(|(name, _)| name.clone());
            let Some(owner) = heaviest else { break };
            if let Some(token) = by_owner.get_mut(&owner).and_then(|tokens| tokens.pop()) {
                suggested.push(token);
            }
        }
        suggested.sort_unstable();
        Ok(suggested)
    }

    /// Acquire the registry lock. Only one join may proceed at a time;
    /// the lock is renewed under its TTL until released.
    pub async fn lock(&self) -> Result<LockGuard> {
        self.store.lock(keys::TOKENS_LOCK, self.config.lock_ttl).await
    }

    pub async fn unlock(&self, guard: LockGuard) -> Result<()> {
        self.store.unlock(guard).await
    }

    /// Take a short-lived lease on a token. Returns false, not an
    /// error, when another unexpired lease exists; the join protocol
    /// simply moves on to the next candidate.
    pub async fn reserve(&self, token: u32, owner: &str) -> Result<bool> {
        self.store
            .put_if_absent(
                &Self::reservation_key(token),
                owner.as_bytes().to_vec(),
                Some(self.config.reservation_ttl),
            )
            .await
    }

    /// Drop a reservation.
    pub async fn release(&self, token: u32) -> Result<()> {
        self.store.delete(&Self::reservation_key(token)).await?;
        Ok(())
    }

    /// Commit ownership of a token. Unconditional: terminates the
    /// token's membership in any prior owner's set and clears any
    /// leftover reservation.
    pub async fn assign(&self, token: u32, owner: &str) -> Result<()> {
        self.store
            .put(&Self::token_key(token), owner.as_bytes().to_vec())
            .await?;
        self.store.delete(&Self::reservation_key(token)).await?;
        Ok(())
    }
}
