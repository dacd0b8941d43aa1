pub mod cluster_client;
pub mod command;
pub mod config;
pub mod error;
pub mod fsm;
pub mod http;
pub mod membership;
pub mod node;
pub mod raft;
pub mod store;
pub mod version;
