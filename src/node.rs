//! Node orchestrator: leader-gated writes, local reads, membership and graceful shutdown.

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    cluster_client::ClusterClient,
    command::Command,
    config::ShutdownPolicy,
    error::{NodeError, ShutdownStep},
    fsm::ApplyOutcome,
    membership::{JoinOutcome, MembershipManager},
    raft::{ClusterMember, NodeMeta, RaftFacade},
    store::KvStore,
};

/// The engine stop step always gets at least this much time, even past the deadline.
const MIN_ENGINE_STOP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Bound on waiting for a proposed command to commit.
    pub apply_timeout: Duration,
    /// Fallback peer for the self-removal request.
    pub leader_api_endpoint: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(3),
            leader_api_endpoint: None,
        }
    }
}

/// Node status as reported by `GET /api/v1/cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub leader_api_base_url: Option<String>,
    pub members: Vec<ClusterMember>,
}

#[derive(Clone)]
pub struct KvNode {
    local: NodeMeta,
    raft: Arc<dyn RaftFacade>,
    store: Arc<dyn KvStore>,
    membership: MembershipManager,
    cluster: ClusterClient,
    settings: NodeSettings,
}

impl KvNode {
    pub fn new(
        local: NodeMeta,
        raft: Arc<dyn RaftFacade>,
        store: Arc<dyn KvStore>,
        settings: NodeSettings,
    ) -> Self {
        Self {
            local,
            membership: MembershipManager::new(raft.clone()),
            raft,
            store,
            cluster: ClusterClient::new(),
            settings,
        }
    }

    pub fn local(&self) -> &NodeMeta {
        &self.local
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    pub fn raft(&self) -> &Arc<dyn RaftFacade> {
        &self.raft
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Metadata of the current leader, when known.
    pub fn leader(&self) -> Option<NodeMeta> {
        self.raft.current_leader().and_then(|id| self.raft.member(id))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), NodeError> {
        if key.is_empty() {
            return Err(NodeError::Validation("key must not be empty".to_string()));
        }
        if value.is_empty() {
            return Err(NodeError::Validation("value must not be empty".to_string()));
        }
        self.propose(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        if key.is_empty() {
            return Err(NodeError::Validation("key must not be empty".to_string()));
        }
        self.propose(Command::delete(key)).await
    }

    /// Served from local state on any node; followers may return stale values.
    pub fn get(&self, key: &str) -> Result<String, NodeError> {
        if key.is_empty() {
            return Err(NodeError::Validation("key must not be empty".to_string()));
        }
        Ok(self.store.get(key)?)
    }

    pub async fn join(&self, candidate: NodeMeta) -> Result<JoinOutcome, NodeError> {
        if candidate.id.trim().is_empty() {
            return Err(NodeError::Validation("node_id must not be empty".to_string()));
        }
        if candidate.raft_addr.trim().is_empty() {
            return Err(NodeError::Validation("address must not be empty".to_string()));
        }
        self.membership.join(candidate).await
    }

    pub async fn remove_node_from_cluster(&self, member_id: &str) -> Result<(), NodeError> {
        if member_id.trim().is_empty() {
            return Err(NodeError::Validation("node id must not be empty".to_string()));
        }
        self.membership.remove(member_id).await
    }

    pub fn status(&self) -> ClusterStatus {
        let leader = self.leader();
        ClusterStatus {
            node_id: self.local.id.clone(),
            is_leader: self.is_leader(),
            leader_id: leader.as_ref().map(|l| l.id.clone()),
            leader_api_base_url: leader
                .map(|l| l.api_base_url)
                .filter(|url| !url.is_empty()),
            members: self.membership.members(),
        }
    }

    async fn propose(&self, cmd: Command) -> Result<(), NodeError> {
        // Advisory; the engine rejects late with NotLeader if leadership moved meanwhile.
        self.membership.ensure_leader()?;

        let encoded = cmd.encode()?;
        let write = self.raft.client_write(encoded);
        let outcome = tokio::time::timeout(self.settings.apply_timeout, write)
            .await
            .map_err(|_| {
                NodeError::consensus(anyhow::anyhow!(
                    "apply timed out after {}ms",
                    self.settings.apply_timeout.as_millis()
                ))
            })??;

        match outcome {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::Skipped { reason } => Err(NodeError::Serialization(reason)),
        }
    }

    /// Leave the cluster and stop the consensus engine within `timeout`.
    ///
    /// Steps: hand off leadership (when leader), ask the remaining leader to remove this node,
    /// stop the engine. A sole voter goes straight to the last step.
    pub async fn shutdown(
        &self,
        timeout: Duration,
        policy: ShutdownPolicy,
    ) -> Result<(), NodeError> {
        let deadline = Instant::now() + timeout;
        let local_id = self.raft.node_id();
        let voters = self.raft.voters();
        let is_voter = voters.iter().any(|(id, _)| *id == local_id);
        let has_peers = voters.iter().any(|(id, _)| *id != local_id);

        let mut first_err: Option<NodeError> = None;

        if is_voter && has_peers {
            if self.is_leader() {
                let res = within(deadline, self.membership.transfer_leadership()).await;
                if let Err(err) = res {
                    fail_step(policy, ShutdownStep::TransferLeadership, err, &mut first_err)?;
                }
            }

            let res = within(deadline, self.remove_self()).await;
            if let Err(err) = res {
                fail_step(policy, ShutdownStep::RemoveSelf, err, &mut first_err)?;
            }
        } else {
            info!(node_id = %self.local.id, "shutdown: no peers to hand off to");
        }

        let stop_deadline = deadline.max(Instant::now() + MIN_ENGINE_STOP);
        let res = within(stop_deadline, async {
            self.raft.shutdown().await.map_err(NodeError::Consensus)
        })
        .await;
        if let Err(err) = res {
            let err = NodeError::shutdown(ShutdownStep::StopEngine, err);
            return Err(first_err.unwrap_or(err));
        }

        info!(node_id = %self.local.id, "consensus engine stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn remove_self(&self) -> Result<(), NodeError> {
        let local_id = self.raft.node_id();
        let target = self
            .raft
            .current_leader()
            .filter(|leader| *leader != local_id)
            .and_then(|leader| self.raft.member(leader))
            .map(|leader| leader.api_base_url)
            .filter(|url| !url.is_empty())
            .or_else(|| self.settings.leader_api_endpoint.clone())
            .ok_or_else(|| {
                NodeError::consensus(anyhow::anyhow!("no peer available to process self-removal"))
            })?;

        info!(node_id = %self.local.id, peer = %target, "requesting self-removal");
        self.cluster
            .remove(&target, &self.local.id, self.settings.apply_timeout)
            .await
            .map_err(NodeError::Consensus)
    }
}

async fn within<T>(
    deadline: Instant,
    fut: impl Future<Output = Result<T, NodeError>>,
) -> Result<T, NodeError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| NodeError::consensus(anyhow::anyhow!("shutdown deadline exceeded")))?
}

fn fail_step(
    policy: ShutdownPolicy,
    step: ShutdownStep,
    err: NodeError,
    first_err: &mut Option<NodeError>,
) -> Result<(), NodeError> {
    let err = NodeError::shutdown(step, err);
    match policy {
        ShutdownPolicy::Strict => Err(err),
        ShutdownPolicy::BestEffort => {
            warn!(step = %step, error = %err, "shutdown step failed; continuing");
            first_err.get_or_insert(err);
            Ok(())
        }
    }
}
