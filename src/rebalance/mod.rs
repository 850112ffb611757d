//! Join, rebalance and reliable data movement
//!
//! Membership changes move data. A joining node steals tokens from
//! incumbents and imports their data before taking ownership
//! (`join`); a removed node's tokens are redistributed through durable
//! import jobs that the receivers drain themselves (`work_queue`). The
//! backend database is driven through the `Importer` collaborator.

pub mod importer;
pub mod join;
pub mod work_queue;

pub use importer::{HttpImporter, Importer};
pub use join::{JoinOutcome, JoinProtocol, ReliableImportHandler};
pub use work_queue::{
    WorkHandler, WorkItem, WorkKind, WorkPayload, WorkQueue, WorkQueueConfig, WorkQueueConsumer,
    WorkState,
};
