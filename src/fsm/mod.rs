//! State machine applier: turns committed log entries into store mutations.
//!
//! Apply is fail-open: an entry that cannot be decoded is logged and skipped so the replication
//! loop keeps running. Restore is fail-closed: a corrupt image is an error and leaves the store
//! untouched.

pub mod snapshot;

use std::{io::Read, sync::Arc};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{command::Command, store::KvStore};

pub use snapshot::{FileSnapshotSink, KvSnapshot, SnapshotSink};

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct KvStateMachine {
    store: Arc<dyn KvStore>,
}

impl KvStateMachine {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Apply one committed command payload. `index` is only used for diagnostics.
    pub fn apply(&self, index: u64, payload: &[u8]) -> ApplyOutcome {
        let cmd = match Command::decode(payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                error!(log_index = index, error = %err, "apply: skip undecodable command");
                return ApplyOutcome::Skipped {
                    reason: format!("decode command: {err}"),
                };
            }
        };

        debug!(log_index = index, key = %cmd.key(), "apply command");
        apply_command(self.store.as_ref(), cmd);
        ApplyOutcome::Applied
    }

    /// Copy of the current state. Holds the store's read lock only for the copy.
    pub fn snapshot(&self) -> KvSnapshot {
        KvSnapshot::new(self.store.snapshot())
    }

    /// Replace local state with the image read from `reader`.
    pub fn restore<R: Read>(&self, mut reader: R) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .context("read snapshot data")?;
        self.restore_bytes(&buf)
    }

    pub fn restore_bytes(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let snapshot = KvSnapshot::decode(bytes).context("decode snapshot data")?;
        self.store.apply_snapshot(snapshot.data);
        Ok(())
    }
}

/// Deterministic transition: the result depends only on the store state and the command.
pub fn apply_command(store: &dyn KvStore, cmd: Command) {
    match cmd {
        Command::Set { key, value } => store.set(key, value),
        Command::Delete { key } => store.delete(&key),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{KvState, MemStore};

    fn fsm() -> KvStateMachine {
        KvStateMachine::new(Arc::new(MemStore::new()))
    }

    fn encoded(cmd: &Command) -> Vec<u8> {
        cmd.encode().unwrap().0
    }

    #[test]
    fn replay_is_deterministic_across_nodes() {
        let log = vec![
            encoded(&Command::set("a", "1")),
            encoded(&Command::set("b", "2")),
            encoded(&Command::delete("a")),
            b"garbage".to_vec(),
            encoded(&Command::set("c", "3")),
            encoded(&Command::set("b", "22")),
            encoded(&Command::delete("missing")),
        ];

        let node_a = fsm();
        let node_b = fsm();
        for (i, entry) in log.iter().enumerate() {
            node_a.apply(i as u64 + 1, entry);
        }
        for (i, entry) in log.iter().enumerate() {
            node_b.apply(i as u64 + 1, entry);
        }

        assert_eq!(node_a.snapshot(), node_b.snapshot());
        assert_eq!(
            node_a.snapshot().encode().unwrap(),
            node_b.snapshot().encode().unwrap()
        );
        assert_eq!(
            node_a.snapshot().data,
            KvState::from([
                ("b".to_string(), "22".to_string()),
                ("c".to_string(), "3".to_string()),
            ])
        );
    }

    #[test]
    fn undecodable_entry_is_skipped_without_mutation() {
        let fsm = fsm();
        fsm.apply(1, &encoded(&Command::set("k", "v")));
        let outcome = fsm.apply(2, br#"{"action":"set","key":"k"}"#);
        assert!(matches!(outcome, ApplyOutcome::Skipped { .. }));
        assert_eq!(fsm.store().get("k").unwrap(), "v");
    }

    #[test]
    fn snapshot_then_restore_on_another_node() {
        let source = fsm();
        source.apply(1, &encoded(&Command::set("k", "v")));
        let image = source.snapshot().encode().unwrap();
        source.apply(2, &encoded(&Command::set("k", "changed")));

        let target = fsm();
        target.apply(1, &encoded(&Command::set("leftover", "x")));
        target.restore(image.as_slice()).unwrap();

        assert_eq!(target.store().get("k").unwrap(), "v");
        assert!(target.store().get("leftover").is_err());
    }

    #[test]
    fn corrupt_restore_fails_and_keeps_state() {
        let fsm = fsm();
        fsm.apply(1, &encoded(&Command::set("k", "v")));
        let err = fsm.restore(&b"{\"data\":"[..]).unwrap_err();
        assert!(err.to_string().contains("decode snapshot data"));
        assert_eq!(fsm.store().get("k").unwrap(), "v");
    }
}
