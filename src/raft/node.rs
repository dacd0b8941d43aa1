use std::path::{Path, PathBuf};

use anyhow::Context;

/// Directory layout under the node's data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftPaths {
    pub root: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl RaftPaths {
    pub fn new(data_dir: &Path) -> Self {
        let root = data_dir.join("raft");
        let snapshot_dir = root.join("snapshots");
        Self { root, snapshot_dir }
    }

    /// Create the layout if missing. The log itself is never written to disk.
    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)
            .with_context(|| format!("create snapshot dir: {}", self.snapshot_dir.display()))
    }
}
