use std::io::Cursor;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{command::EncodedCommand, fsm::ApplyOutcome};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in the membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// The operator-facing member id (`--local-id`).
    pub id: String,

    /// Replication endpoint (`host:port`) serving the Raft RPC routes.
    pub raft_addr: String,

    /// The control-plane API origin, used for join forwarding and self-removal.
    #[serde(default)]
    pub api_base_url: String,
}

impl NodeMeta {
    pub fn raft_base_url(&self) -> String {
        if self.raft_addr.starts_with("http://") || self.raft_addr.starts_with("https://") {
            self.raft_addr.clone()
        } else {
            format!("http://{}", self.raft_addr)
        }
    }
}

impl std::fmt::Display for NodeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.raft_addr)
    }
}

/// A voting participant as seen by the membership manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
}

impl ClusterMember {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Map an operator-facing member id onto the numeric id openraft needs.
///
/// The first 8 bytes (big-endian) of SHA-256(id); stable across processes and versions.
pub fn raft_node_id(member_id: &str) -> NodeId {
    let digest = Sha256::digest(member_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// OpenRaft type configuration for this project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = EncodedCommand;
    type R = ApplyOutcome;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    type SnapshotData = Cursor<Vec<u8>>;
}
