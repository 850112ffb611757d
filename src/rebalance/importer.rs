//! Backend database import/delete collaborator
//!
//! The backend exposes two verbs: pull the data for a set of partition
//! tokens from another instance, and drop the local data for a token.
//! Imports are idempotent on the backend side, so a cancelled or
//! repeated import leaves the system re-runnable.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Drives the local backend database during rebalancing
#[async_trait]
pub trait Importer: Send + Sync {
    /// Pull data for `tokens` from the backend instance at `source`
    /// into the local instance. Returns bytes copied.
    async fn import(&self, tokens: &[u32], source: &str) -> Result<u64>;

    /// Drop local data belonging to `token`.
    async fn delete(&self, token: u32) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
    tokens: &'a [u32],
    source: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImportResponse {
    bytes_copied: u64,
}

#[derive(Debug, Serialize)]
struct DeleteRequest {
    token: u32,
}

/// Importer speaking to the backend's admin HTTP endpoints
pub struct HttpImporter {
    client: reqwest::Client,
    /// Local backend instance receiving imports and deletes
    data_location: String,
}

impl HttpImporter {
    pub fn new(data_location: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            data_location: data_location.into(),
        }
    }

    fn admin_url(&self, verb: &str) -> String {
        format!("http://{}/admin/{verb}", self.data_location)
    }
}

#[async_trait]
impl Importer for HttpImporter {
    async fn import(&self, tokens: &[u32], source: &str) -> Result<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let response = self
            .client
            .post(self.admin_url("import"))
            .json(&ImportRequest { tokens, source })
            .send()
            .await?
            .error_for_status()
            .map_err(|err| Error::Import(err.to_string()))?;
        let parsed: ImportResponse = response.json().await?;
        info!(
            tokens = tokens.len(),
            source,
            bytes = parsed.bytes_copied,
            "import finished"
        );
        Ok(parsed.bytes_copied)
    }

    async fn delete(&self, token: u32) -> Result<()> {
        self.client
            .post(self.admin_url("delete"))
            .json(&DeleteRequest { token })
            .send()
            .await?
            .error_for_status()
            .map_err(|err| Error::Import(err.to_string()))?;
        Ok(())
    }
}
