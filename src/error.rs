//! Error types for fluxgate

/// Result type alias for fluxgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for fluxgate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// etcd client errors
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    /// Coordination store errors not tied to a specific backend
    #[error("Coordination store error: {0}")]
    Coordination(String),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Outbound HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// A token was seeded twice
    #[error("Token {0} already exists in the ring")]
    TokenConflict(u32),
    /// Unknown node
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// A node status changed in a direction the lifecycle forbids
    #[error("Invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),
    /// Concurrent modification detected (CAS failure)
    #[error("Conflict: concurrent modification detected")]
    Conflict,
    /// Tag values may not contain the partition separator
    #[error("Invalid partition tag value: {0}")]
    InvalidTagValue(String),
    /// Data import from another node failed
    #[error("Import failed: {0}")]
    Import(String),
    /// Too many retries
    #[error("Too many retries: operation failed after maximum retry attempts")]
    TooManyRetries,
    /// Timeout
    #[error("Operation timed out")]
    Timeout,
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
