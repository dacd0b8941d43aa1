use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use openraft::entry::RaftPayload as _;
use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta, StoredMembership,
    storage::RaftStateMachine,
};

use crate::{
    fsm::{ApplyOutcome, KvStateMachine},
    raft::{
        storage::{FileSnapshotStore, io_err},
        types::{NodeId, NodeMeta, TypeConfig},
    },
};

#[derive(Debug, Default)]
struct StateMachineInner {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

/// openraft state machine backed by `KvStateMachine` and a `FileSnapshotStore`.
#[derive(Debug, Clone)]
pub struct KvRaftStateMachine {
    fsm: KvStateMachine,
    snapshots: FileSnapshotStore,
    inner: Arc<Mutex<StateMachineInner>>,
}

impl KvRaftStateMachine {
    /// Open the state machine and restore the newest persisted snapshot, if any.
    ///
    /// A snapshot that cannot be decoded fails the open: starting from a partial state is worse
    /// than not starting.
    pub async fn open(
        fsm: KvStateMachine,
        snapshots: FileSnapshotStore,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let mut inner = StateMachineInner::default();

        let latest = {
            let snapshots = snapshots.clone();
            blocking(move || snapshots.latest())
                .await
                .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?
        };

        if let Some((meta, bytes)) = latest {
            fsm.restore_bytes(&bytes).map_err(|e| {
                io_err(
                    ErrorSubject::Snapshot(Some(meta.signature())),
                    ErrorVerb::Read,
                    std::io::Error::other(format!("{e:#}")),
                )
            })?;
            info!(
                snapshot_id = %meta.snapshot_id,
                last_log_id = ?meta.last_log_id,
                "restored persisted snapshot"
            );
            inner.last_applied = meta.last_log_id;
            inner.last_membership = meta.last_membership;
        }

        Ok(Self {
            fsm,
            snapshots,
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

#[derive(Debug)]
pub struct KvSnapshotBuilder {
    fsm: KvStateMachine,
    snapshots: FileSnapshotStore,
    inner: Arc<Mutex<StateMachineInner>>,
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        // Holding the inner lock pins last_applied to the copied state; apply waits on it.
        let (meta, snapshot) = {
            let inner = self.inner.lock().await;
            let snapshot = self.fsm.snapshot();
            let meta = SnapshotMeta {
                last_log_id: inner.last_applied,
                last_membership: inner.last_membership.clone(),
                snapshot_id: format!(
                    "snapshot-{}",
                    inner.last_applied.as_ref().map(|l| l.index).unwrap_or(0)
                ),
            };
            (meta, snapshot)
        };

        let bytes = snapshot.encode().map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                std::io::Error::other(e),
            )
        })?;

        {
            let snapshots = self.snapshots.clone();
            let meta = meta.clone();
            blocking(move || {
                snapshots
                    .save(&meta, &snapshot)
                    .map_err(|e| std::io::Error::other(format!("{e:#}")))
            })
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        }

        info!(snapshot_id = %meta.snapshot_id, bytes = bytes.len(), "built snapshot");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for KvRaftStateMachine {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let inner = self.inner.lock().await;
        Ok((inner.last_applied, inner.last_membership.clone()))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<ApplyOutcome>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();
        let mut inner = self.inner.lock().await;

        for entry in entries {
            let log_id = entry.log_id;
            if let Some(membership) = entry.get_membership() {
                inner.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let outcome = match entry.payload {
                EntryPayload::Normal(cmd) => self.fsm.apply(log_id.index, cmd.as_bytes()),
                EntryPayload::Membership(_) | EntryPayload::Blank => ApplyOutcome::Applied,
            };

            inner.last_applied = Some(log_id);
            responses.push(outcome);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            fsm: self.fsm.clone(),
            snapshots: self.snapshots.clone(),
            inner: self.inner.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let bytes = snapshot.into_inner();
        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = bytes.len(),
            "installing snapshot"
        );

        {
            let mut inner = self.inner.lock().await;
            self.fsm.restore_bytes(&bytes).map_err(|e| {
                io_err(
                    ErrorSubject::Snapshot(Some(meta.signature())),
                    ErrorVerb::Read,
                    std::io::Error::other(format!("{e:#}")),
                )
            })?;
            inner.last_applied = meta.last_log_id;
            inner.last_membership = meta.last_membership.clone();
        }

        let snapshots = self.snapshots.clone();
        let meta = meta.clone();
        blocking(move || {
            snapshots
                .save_bytes(&meta, &bytes)
                .map_err(|e| std::io::Error::other(format!("{e:#}")))
        })
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        let snapshots = self.snapshots.clone();
        let latest = blocking(move || snapshots.latest())
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(latest.map(|(meta, bytes)| Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        }))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, std::io::Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, std::io::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}
