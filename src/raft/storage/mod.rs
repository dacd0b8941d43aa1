//! Storage adapters for openraft (storage v2).
//!
//! - `MemLogStore`: log entries, vote and committed id, kept in memory only.
//! - `KvRaftStateMachine`: feeds committed entries to the key/value state machine.
//! - `FileSnapshotStore`: durable snapshot images under `<data-dir>/raft/snapshots`.

pub mod log_store;
pub mod snapshot_store;
pub mod state_machine;

pub use log_store::MemLogStore;
pub use snapshot_store::FileSnapshotStore;
pub use state_machine::{KvRaftStateMachine, KvSnapshotBuilder};

use openraft::{ErrorSubject, ErrorVerb};

use crate::raft::types::NodeId;

pub(crate) fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}
