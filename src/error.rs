use crate::{
    raft::{NodeMeta, WriteError},
    store::KeyNotFound,
};

/// Errors surfaced by the node orchestrator and the membership manager.
#[derive(Debug)]
pub enum NodeError {
    /// Rejected before reaching the log (empty key, empty member id, ...).
    Validation(String),
    NotFound { key: String },
    /// A leader-only operation reached a follower. `leader` is the last known leader, if any.
    NotLeader { leader: Option<NodeMeta> },
    /// Log append, configuration change or transport failure (including timeouts).
    Consensus(anyhow::Error),
    /// A command or snapshot payload could not be encoded or decoded.
    Serialization(String),
    /// A shutdown step failed; later steps were handled per the shutdown policy.
    Shutdown {
        step: ShutdownStep,
        source: Box<NodeError>,
    },
}

/// The ordered steps of a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    TransferLeadership,
    RemoveSelf,
    StopEngine,
}

impl ShutdownStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransferLeadership => "transfer_leadership",
            Self::RemoveSelf => "remove_self",
            Self::StopEngine => "stop_engine",
        }
    }
}

impl std::fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeError {
    pub fn consensus(err: impl Into<anyhow::Error>) -> Self {
        Self::Consensus(err.into())
    }

    pub fn shutdown(step: ShutdownStep, source: NodeError) -> Self {
        Self::Shutdown {
            step,
            source: Box::new(source),
        }
    }

    /// The failed shutdown step, when this is a shutdown error.
    pub fn shutdown_step(&self) -> Option<ShutdownStep> {
        match self {
            Self::Shutdown { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. })
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "invalid request: {msg}"),
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::NotLeader {
                leader: Some(leader),
            } => write!(f, "not the leader; current leader is {leader}"),
            Self::NotLeader { leader: None } => write!(f, "not the leader; leader unknown"),
            Self::Consensus(err) => write!(f, "consensus error: {err:#}"),
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Self::Shutdown { step, source } => write!(f, "shutdown step {step} failed: {source}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Consensus(err) => Some(err.as_ref()),
            Self::Shutdown { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<KeyNotFound> for NodeError {
    fn from(value: KeyNotFound) -> Self {
        Self::NotFound { key: value.key }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<WriteError> for NodeError {
    fn from(value: WriteError) -> Self {
        match value {
            WriteError::NotLeader { leader, .. } => Self::NotLeader { leader },
            WriteError::Other(err) => Self::Consensus(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_error_names_the_step() {
        let err = NodeError::shutdown(
            ShutdownStep::RemoveSelf,
            NodeError::consensus(anyhow::anyhow!("connection refused")),
        );
        assert_eq!(err.shutdown_step(), Some(ShutdownStep::RemoveSelf));
        assert_eq!(
            err.to_string(),
            "shutdown step remove_self failed: consensus error: connection refused"
        );
    }

    #[test]
    fn write_error_not_leader_keeps_leader_hint() {
        let leader = NodeMeta {
            id: "node-2".to_string(),
            raft_addr: "127.0.0.1:9002".to_string(),
            api_base_url: "http://127.0.0.1:8002".to_string(),
        };
        let err = NodeError::from(WriteError::NotLeader {
            leader_id: Some(2),
            leader: Some(leader.clone()),
        });
        assert!(err.is_not_leader());
        assert!(err.to_string().contains("node-2@127.0.0.1:9002"));
    }
}
