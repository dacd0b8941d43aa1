//! Cluster membership on top of the consensus engine's configuration log.
//!
//! The configuration is owned by the engine. Every operation re-reads it from the metrics channel
//! right before acting and never keeps a copy between calls.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use openraft::ChangeMembers;
use tracing::{debug, info};

use crate::{
    error::NodeError,
    raft::{ClusterMember, NodeId, NodeMeta, RaftFacade, raft_node_id},
};

/// What a successful join did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The exact (id, address) pair was already a voter.
    AlreadyMember,
    /// The candidate was added; `replaced` lists the stale members removed first.
    Added { replaced: Vec<ClusterMember> },
}

#[derive(Clone)]
pub struct MembershipManager {
    raft: Arc<dyn RaftFacade>,
}

impl MembershipManager {
    pub fn new(raft: Arc<dyn RaftFacade>) -> Self {
        Self { raft }
    }

    /// Voting members of the current configuration, sorted by id.
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut members: Vec<ClusterMember> = self
            .raft
            .voters()
            .into_iter()
            .map(|(_, node)| ClusterMember::new(node.id, node.raft_addr))
            .collect();
        members.sort();
        members
    }

    /// Register `local` as the sole voter of a new cluster.
    ///
    /// Returns `false` without touching anything when a configuration already exists.
    pub async fn bootstrap(&self, local: NodeMeta) -> Result<bool, NodeError> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .map_err(NodeError::Consensus)?;
        if initialized || !self.raft.voters().is_empty() {
            debug!(node_id = %local.id, "bootstrap skipped: configuration not empty");
            return Ok(false);
        }

        let node_id = raft_node_id(&local.id);
        info!(
            node_id = %local.id,
            address = %local.raft_addr,
            "bootstrapping single-voter cluster"
        );
        self.raft
            .initialize(BTreeMap::from([(node_id, local)]))
            .await
            .map_err(NodeError::Consensus)?;
        Ok(true)
    }

    /// Add `candidate` as a voter, replacing any voter or learner that shares its id or its
    /// address.
    pub async fn join(&self, candidate: NodeMeta) -> Result<JoinOutcome, NodeError> {
        self.ensure_leader()?;

        let candidate_id = raft_node_id(&candidate.id);
        let local_id = self.raft.node_id();
        let voters: BTreeSet<NodeId> = self.raft.voters().into_iter().map(|(id, _)| id).collect();
        let mut stale: Vec<(NodeId, NodeMeta)> = Vec::new();
        for (id, node) in self.raft.nodes() {
            let same_id = node.id == candidate.id;
            let same_addr = node.raft_addr == candidate.raft_addr;
            if same_id && same_addr {
                if voters.contains(&id) {
                    debug!(
                        node_id = %candidate.id,
                        address = %candidate.raft_addr,
                        "join: already a voter"
                    );
                    return Ok(JoinOutcome::AlreadyMember);
                }
                // A learner left by an interrupted join; promote it below.
                continue;
            }
            if same_id || same_addr {
                stale.push((id, node));
            }
        }

        if stale.iter().any(|(id, _)| *id == local_id) {
            return Err(NodeError::Validation(format!(
                "address {} belongs to the leader itself",
                candidate.raft_addr
            )));
        }

        let mut replaced = Vec::with_capacity(stale.len());
        for (id, node) in stale {
            info!(
                stale_id = %node.id,
                stale_address = %node.raft_addr,
                node_id = %candidate.id,
                "join: removing stale member"
            );
            let changes = if voters.contains(&id) {
                ChangeMembers::RemoveVoters(BTreeSet::from([id]))
            } else {
                ChangeMembers::RemoveNodes(BTreeSet::from([id]))
            };
            self.raft.change_membership(changes, false).await?;
            replaced.push(ClusterMember::new(node.id, node.raft_addr));
        }

        info!(node_id = %candidate.id, address = %candidate.raft_addr, "join: adding voter");
        self.raft.add_learner(candidate_id, candidate).await?;
        self.raft
            .change_membership(
                ChangeMembers::AddVoterIds(BTreeSet::from([candidate_id])),
                false,
            )
            .await?;
        Ok(JoinOutcome::Added { replaced })
    }

    /// Drop `member_id` from the configuration. Leader only; removing an unknown id is a no-op.
    pub async fn remove(&self, member_id: &str) -> Result<(), NodeError> {
        self.ensure_leader()?;

        let id = raft_node_id(member_id);
        let is_voter = self.raft.voters().iter().any(|(voter, _)| *voter == id);
        let changes = if is_voter {
            ChangeMembers::RemoveVoters(BTreeSet::from([id]))
        } else if self.raft.member(id).is_some() {
            ChangeMembers::RemoveNodes(BTreeSet::from([id]))
        } else {
            debug!(node_id = %member_id, "remove: not a member");
            return Ok(());
        };

        info!(node_id = %member_id, "removing member");
        self.raft.change_membership(changes, false).await?;
        Ok(())
    }

    /// Hand leadership to another voter and wait until a different leader is observed.
    ///
    /// Unbounded on its own; callers wrap it in their deadline.
    pub async fn transfer_leadership(&self) -> Result<NodeId, NodeError> {
        self.ensure_leader()?;

        let local_id = self.raft.node_id();
        let target = self
            .raft
            .voters()
            .into_iter()
            .map(|(id, _)| id)
            .find(|id| *id != local_id)
            .ok_or_else(|| {
                NodeError::consensus(anyhow::anyhow!("no other voter to transfer leadership to"))
            })?;

        info!(target, "transferring leadership");
        self.raft
            .transfer_leader(target)
            .await
            .map_err(NodeError::Consensus)?;

        let mut metrics = self.raft.metrics();
        loop {
            {
                let m = metrics.borrow_and_update();
                if let Some(leader) = m.current_leader
                    && leader != local_id
                {
                    info!(leader, "leadership transferred");
                    return Ok(leader);
                }
            }
            metrics.changed().await.map_err(|_| {
                NodeError::consensus(anyhow::anyhow!(
                    "metrics channel closed while waiting for a new leader"
                ))
            })?;
        }
    }

    pub fn ensure_leader(&self) -> Result<(), NodeError> {
        if self.raft.is_leader() {
            return Ok(());
        }
        let leader = self.raft.current_leader().and_then(|id| self.raft.member(id));
        Err(NodeError::NotLeader { leader })
    }
}
