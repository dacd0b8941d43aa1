//! Consensus engine binding: openraft type configuration, storage adapters, HTTP transport and
//! the capability interface the rest of the crate talks to.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod node;
pub mod runtime;
pub mod storage;
pub mod types;

pub use app::{LocalRaft, RaftFacade, RealRaft, WriteError};
pub use node::RaftPaths;
pub use types::{ClusterMember, NodeId, NodeMeta, TypeConfig, raft_node_id};
