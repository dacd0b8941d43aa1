use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use openraft::{ChangeMembers, Membership, RaftMetrics, ServerState, StoredMembership};
use tokio::sync::watch;

use crate::{
    command::EncodedCommand,
    fsm::{ApplyOutcome, KvStateMachine},
    raft::types::{NodeId, NodeMeta, TypeConfig},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Metrics = RaftMetrics<NodeId, NodeMeta>;

/// Failure of a leader-only proposal.
#[derive(Debug)]
pub enum WriteError {
    /// This node cannot accept the proposal; `leader` is the last known leader, if any.
    NotLeader {
        leader_id: Option<NodeId>,
        leader: Option<NodeMeta>,
    },
    Other(anyhow::Error),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader {
                leader: Some(leader),
                ..
            } => write!(f, "not the leader; leader is {leader}"),
            Self::NotLeader { .. } => write!(f, "not the leader; leader unknown"),
            Self::Other(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for WriteError {}

/// The consensus capabilities the node needs. Everything else is read from `metrics`.
pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<Metrics>;

    fn client_write(&self, cmd: EncodedCommand)
    -> BoxFuture<'_, Result<ApplyOutcome, WriteError>>;

    fn is_initialized(&self) -> BoxFuture<'_, anyhow::Result<bool>>;

    fn initialize(&self, members: BTreeMap<NodeId, NodeMeta>)
    -> BoxFuture<'_, anyhow::Result<()>>;

    /// Adds `node` as a non-voting member and waits until it has caught up.
    fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, Result<(), WriteError>>;

    fn change_membership(
        &self,
        changes: ChangeMembers<NodeId, NodeMeta>,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), WriteError>>;

    /// Hands leadership to the voter `to` once it has caught up with the local log.
    fn transfer_leader(&self, to: NodeId) -> BoxFuture<'_, anyhow::Result<()>>;

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn node_id(&self) -> NodeId {
        self.metrics().borrow().id
    }

    fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    fn is_leader(&self) -> bool {
        let metrics = self.metrics();
        let m = metrics.borrow();
        m.current_leader == Some(m.id) && m.state == ServerState::Leader
    }

    /// Voting members of the latest known configuration.
    fn voters(&self) -> Vec<(NodeId, NodeMeta)> {
        let metrics = self.metrics();
        let m = metrics.borrow();
        let membership = m.membership_config.membership();
        membership
            .voter_ids()
            .filter_map(|id| membership.get_node(&id).map(|node| (id, node.clone())))
            .collect()
    }

    /// Every member of the latest known configuration, voters and learners alike.
    fn nodes(&self) -> Vec<(NodeId, NodeMeta)> {
        let metrics = self.metrics();
        let m = metrics.borrow();
        m.membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect()
    }

    fn member(&self, node_id: NodeId) -> Option<NodeMeta> {
        let metrics = self.metrics();
        let m = metrics.borrow();
        m.membership_config.membership().get_node(&node_id).cloned()
    }
}

fn forward_or_other(
    err: openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, NodeMeta>>,
    what: &str,
) -> WriteError {
    if let Some(openraft::error::ClientWriteError::ForwardToLeader(forward)) = err.api_error() {
        return WriteError::NotLeader {
            leader_id: forward.leader_id,
            leader: forward.leader_node.clone(),
        };
    }
    WriteError::Other(anyhow::anyhow!("raft {what}: {err}"))
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<Metrics>,
    client: reqwest::Client,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self {
            raft,
            metrics,
            client: reqwest::Client::new(),
        }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    /// Wait until `to` has matched every entry in the local log.
    async fn wait_replicated(&self, to: NodeId) -> anyhow::Result<()> {
        let mut metrics = self.raft.metrics();
        loop {
            {
                let m = metrics.borrow_and_update();
                if m.state != ServerState::Leader {
                    anyhow::bail!("raft transfer_leader: no longer the leader");
                }
                let matched = m
                    .replication
                    .as_ref()
                    .and_then(|r| r.get(&to))
                    .and_then(|log_id| log_id.as_ref())
                    .map(|log_id| log_id.index);
                if matched.is_some() && matched >= m.last_log_index {
                    return Ok(());
                }
            }
            metrics
                .changed()
                .await
                .context("raft metrics closed while waiting for replication")?;
        }
    }

    /// Let the voters' leader lease lapse, then ask `target` to campaign.
    async fn hand_off(&self, to: NodeId, target: &NodeMeta) -> anyhow::Result<()> {
        let config = self.raft.config();
        let lease = Duration::from_millis(config.election_timeout_max);
        tokio::time::sleep(lease + Duration::from_millis(config.heartbeat_interval)).await;

        let url = format!("{}/raft/elect", target.raft_base_url().trim_end_matches('/'));
        let res: Result<(), String> = self
            .client
            .post(&url)
            .timeout(lease)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?
            .json()
            .await
            .with_context(|| format!("decode {url}"))?;
        res.map_err(|e| anyhow::anyhow!("raft elect on {target}: {e}"))?;

        let local_id = self.node_id();
        self.raft
            .wait(Some(lease * 2))
            .metrics(
                |m| m.current_leader.is_some_and(|leader| leader != local_id),
                "leadership handed off",
            )
            .await
            .map_err(|e| anyhow::anyhow!("raft transfer_leader to {to}: {e}"))?;
        Ok(())
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn client_write(
        &self,
        cmd: EncodedCommand,
    ) -> BoxFuture<'_, Result<ApplyOutcome, WriteError>> {
        Box::pin(async move {
            let resp = self
                .raft
                .client_write(cmd)
                .await
                .map_err(|e| forward_or_other(e, "client_write"))?;
            Ok(resp.data)
        })
    }

    fn is_initialized(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            self.raft
                .is_initialized()
                .await
                .context("raft is_initialized")
        })
    }

    fn initialize(
        &self,
        members: BTreeMap<NodeId, NodeMeta>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .initialize(members)
                .await
                .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))
        })
    }

    fn add_learner(
        &self,
        node_id: NodeId,
        node: NodeMeta,
    ) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            self.raft
                .add_learner(node_id, node, true)
                .await
                .map_err(|e| forward_or_other(e, "add_learner"))?;
            Ok(())
        })
    }

    fn change_membership(
        &self,
        changes: ChangeMembers<NodeId, NodeMeta>,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            self.raft
                .change_membership(changes, retain)
                .await
                .map_err(|e| forward_or_other(e, "change_membership"))?;
            Ok(())
        })
    }

    fn transfer_leader(&self, to: NodeId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let target = self
                .member(to)
                .ok_or_else(|| anyhow::anyhow!("raft transfer_leader: {to} is not a member"))?;
            self.wait_replicated(to).await?;

            // Voters refuse a campaign while heartbeats keep renewing their lease.
            self.raft.runtime_config().heartbeat(false);
            let res = self.hand_off(to, &target).await;
            self.raft.runtime_config().heartbeat(true);
            res
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))
        })
    }
}

/// A single-process Raft facade: commands are applied straight to the local state machine and
/// membership lives in the metrics channel. Used by tests and by the control-plane unit tests.
#[derive(Clone)]
pub struct LocalRaft {
    fsm: KvStateMachine,
    metrics_tx: Arc<watch::Sender<Metrics>>,
    metrics: watch::Receiver<Metrics>,
    stalled: Arc<AtomicBool>,
}

impl LocalRaft {
    pub fn new(node_id: NodeId, fsm: KvStateMachine) -> Self {
        let (tx, rx) = watch::channel(RaftMetrics::new_initial(node_id));
        Self {
            fsm,
            metrics_tx: Arc::new(tx),
            metrics: rx,
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pretend a different node won an election (or none, with `None`).
    pub fn set_leader(&self, leader: Option<NodeId>) {
        self.metrics_tx.send_modify(|m| {
            m.current_leader = leader;
            m.state = if leader == Some(m.id) {
                ServerState::Leader
            } else {
                ServerState::Follower
            };
        });
    }

    /// While stalled, proposals never commit.
    pub fn stall_writes(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    fn not_leader(&self) -> Option<WriteError> {
        let m = self.metrics.borrow();
        if m.state == ServerState::Shutdown {
            return Some(WriteError::Other(anyhow::anyhow!("raft is shut down")));
        }
        if m.current_leader == Some(m.id) {
            return None;
        }
        let leader = m
            .current_leader
            .and_then(|id| m.membership_config.membership().get_node(&id).cloned());
        Some(WriteError::NotLeader {
            leader_id: m.current_leader,
            leader,
        })
    }

    fn update_membership(
        &self,
        f: impl FnOnce(
            &mut BTreeSet<NodeId>,
            &mut BTreeMap<NodeId, NodeMeta>,
        ) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let current = self.metrics.borrow().membership_config.clone();
        let mut voters: BTreeSet<NodeId> = current.membership().voter_ids().collect();
        let mut nodes: BTreeMap<NodeId, NodeMeta> = current
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect();
        f(&mut voters, &mut nodes)?;
        let membership = Membership::new(vec![voters], nodes);
        self.metrics_tx.send_modify(|m| {
            m.membership_config = Arc::new(StoredMembership::new(None, membership));
        });
        Ok(())
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn client_write(
        &self,
        cmd: EncodedCommand,
    ) -> BoxFuture<'_, Result<ApplyOutcome, WriteError>> {
        Box::pin(async move {
            if let Some(err) = self.not_leader() {
                return Err(err);
            }
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let index = self.metrics.borrow().last_applied.map_or(0, |l| l.index) + 1;
            let outcome = self.fsm.apply(index, cmd.as_bytes());
            self.metrics_tx.send_modify(|m| {
                m.last_log_index = Some(index);
                m.last_applied = Some(openraft::LogId::new(
                    openraft::CommittedLeaderId::new(1, m.id),
                    index,
                ));
            });
            Ok(outcome)
        })
    }

    fn is_initialized(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            let m = self.metrics.borrow();
            Ok(m.membership_config.membership().voter_ids().next().is_some())
        })
    }

    fn initialize(
        &self,
        members: BTreeMap<NodeId, NodeMeta>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let id = self.node_id();
            self.update_membership(|voters, nodes| {
                if !voters.is_empty() {
                    anyhow::bail!("raft initialize: already initialized");
                }
                if !members.contains_key(&id) {
                    anyhow::bail!("raft initialize: local node {id} not in members");
                }
                voters.extend(members.keys().copied());
                nodes.extend(members);
                Ok(())
            })?;
            self.set_leader(Some(id));
            Ok(())
        })
    }

    fn add_learner(
        &self,
        node_id: NodeId,
        node: NodeMeta,
    ) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            if let Some(err) = self.not_leader() {
                return Err(err);
            }
            self.update_membership(|_voters, nodes| {
                nodes.insert(node_id, node);
                Ok(())
            })
            .map_err(WriteError::Other)
        })
    }

    fn change_membership(
        &self,
        changes: ChangeMembers<NodeId, NodeMeta>,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            if let Some(err) = self.not_leader() {
                return Err(err);
            }
            self.update_membership(|voters, nodes| {
                match changes {
                    ChangeMembers::AddVoterIds(ids) => {
                        for id in ids {
                            if !nodes.contains_key(&id) {
                                anyhow::bail!("raft change_membership: unknown learner {id}");
                            }
                            voters.insert(id);
                        }
                    }
                    ChangeMembers::AddVoters(added) => {
                        voters.extend(added.keys().copied());
                        nodes.extend(added);
                    }
                    ChangeMembers::RemoveVoters(ids) => {
                        for id in ids {
                            voters.remove(&id);
                            if !retain {
                                nodes.remove(&id);
                            }
                        }
                    }
                    ChangeMembers::RemoveNodes(ids) => {
                        for id in ids {
                            if voters.contains(&id) {
                                anyhow::bail!("raft change_membership: {id} is still a voter");
                            }
                            nodes.remove(&id);
                        }
                    }
                    other => anyhow::bail!("raft change_membership: unsupported {other:?}"),
                }
                if voters.is_empty() {
                    anyhow::bail!("raft change_membership: no voters left");
                }
                Ok(())
            })
            .map_err(WriteError::Other)?;

            let id = self.node_id();
            if !self.voters().iter().any(|(voter, _)| *voter == id) {
                self.set_leader(None);
            }
            Ok(())
        })
    }

    fn transfer_leader(&self, to: NodeId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            if !self.voters().iter().any(|(id, _)| *id == to) {
                anyhow::bail!("raft transfer_leader: {to} is not a voter");
            }
            self.set_leader(Some(to));
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.metrics_tx.send_modify(|m| {
                m.state = ServerState::Shutdown;
                m.current_leader = None;
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{command::Command, store::MemStore};

    fn meta(id: &str, port: u16) -> NodeMeta {
        NodeMeta {
            id: id.to_string(),
            raft_addr: format!("127.0.0.1:{port}"),
            api_base_url: String::new(),
        }
    }

    fn local(id: NodeId) -> LocalRaft {
        LocalRaft::new(id, KvStateMachine::new(Arc::new(MemStore::new())))
    }

    #[tokio::test]
    async fn local_raft_initialize_makes_self_leader() {
        let raft = local(1);
        assert!(!raft.is_initialized().await.unwrap());
        raft.initialize(BTreeMap::from([(1, meta("a", 1))]))
            .await
            .unwrap();
        assert!(raft.is_initialized().await.unwrap());
        assert!(raft.is_leader());
        assert_eq!(raft.voters(), vec![(1, meta("a", 1))]);
        assert!(
            raft.initialize(BTreeMap::from([(1, meta("a", 1))]))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn local_raft_follower_rejects_writes_with_leader_hint() {
        let raft = local(1);
        raft.initialize(BTreeMap::from([(1, meta("a", 1))]))
            .await
            .unwrap();
        raft.add_learner(2, meta("b", 2)).await.unwrap();
        raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([2])), false)
            .await
            .unwrap();
        raft.set_leader(Some(2));

        let err = raft
            .client_write(Command::set("k", "v").encode().unwrap())
            .await
            .unwrap_err();
        match err {
            WriteError::NotLeader { leader_id, leader } => {
                assert_eq!(leader_id, Some(2));
                assert_eq!(leader, Some(meta("b", 2)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn local_raft_remove_voter_drops_node_without_retain() {
        let raft = local(1);
        raft.initialize(BTreeMap::from([(1, meta("a", 1)), (2, meta("b", 2))]))
            .await
            .unwrap();
        raft.change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([2])), false)
            .await
            .unwrap();
        assert_eq!(raft.voters(), vec![(1, meta("a", 1))]);
        assert_eq!(raft.member(2), None);
    }
}
