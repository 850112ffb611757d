//! Hinted handoff
//!
//! When a write cannot reach one of its replicas, the originating node
//! parks a durable hint addressed to that replica and replays it once
//! the replica comes back. The payload lives in a local append-only log
//! (`store`); a small marker per hint is also kept in the coordination
//! store so the *target* can tell that others are holding data for it
//! and stay in Recovering until they have drained (`recovery`).

pub mod recovery;
pub mod store;

pub use recovery::{wait_until_recovered, HintReplayer, HttpHintReplayer, RecoveryDriver};
pub use store::{Hint, HintStore};

use std::path::PathBuf;
use std::time::Duration;

/// Hinted handoff configuration
#[derive(Debug, Clone)]
pub struct HintConfig {
    /// Directory holding the hint log
    pub dir: PathBuf,
    /// How often the recovery driver scans for replayable targets
    pub replay_interval: Duration,
    /// First backoff after a failed replay to a target
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/fluxgate/hints"),
            replay_interval: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}
