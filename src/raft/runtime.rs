use std::sync::Arc;

use anyhow::Context;

use crate::{
    fsm::KvStateMachine,
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        node::RaftPaths,
        storage::{FileSnapshotStore, KvRaftStateMachine, MemLogStore},
        types::{NodeId, TypeConfig},
    },
};

/// Knobs for one consensus engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftSettings {
    pub cluster_name: String,
    /// Number of persisted snapshots kept on disk.
    pub snapshot_retain: usize,
    /// Build a snapshot once this many entries were applied since the last one.
    pub snapshot_logs_since_last: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            cluster_name: "raftkv".to_string(),
            snapshot_retain: 2,
            snapshot_logs_since_last: 1024,
        }
    }
}

pub async fn start_raft(
    paths: &RaftPaths,
    node_id: NodeId,
    settings: &RaftSettings,
    fsm: KvStateMachine,
    network: HttpNetworkFactory,
) -> anyhow::Result<RealRaft> {
    let config = {
        #[cfg(test)]
        {
            openraft::Config {
                cluster_name: settings.cluster_name.clone(),
                snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                    settings.snapshot_logs_since_last,
                ),
                ..Default::default()
            }
        }

        #[cfg(not(test))]
        {
            // LAN defaults; `heartbeat_interval` is also the hard TTL for replication RPCs.
            openraft::Config {
                cluster_name: settings.cluster_name.clone(),
                heartbeat_interval: 250,
                election_timeout_min: 1_000,
                election_timeout_max: 2_000,
                install_snapshot_timeout: 10_000,
                snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                    settings.snapshot_logs_since_last,
                ),
                max_in_snapshot_log_to_keep: settings.snapshot_logs_since_last,
                ..Default::default()
            }
        }
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let config = Arc::new(config);

    paths.ensure().context("create raft dirs")?;
    let snapshots = FileSnapshotStore::open(&paths.snapshot_dir, settings.snapshot_retain)
        .with_context(|| format!("open snapshot store: {}", paths.snapshot_dir.display()))?;
    let state_machine = KvRaftStateMachine::open(fsm, snapshots)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;
    let log_store = MemLogStore::new();

    let raft =
        openraft::Raft::<TypeConfig>::new(node_id, config, network, log_store, state_machine)
            .await
            .context("start raft")?;

    // Initialization is left to the caller: it depends on whether this node joins a cluster.
    Ok(RealRaft::new(raft))
}
