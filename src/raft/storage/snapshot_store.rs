use std::{
    fs, io,
    path::PathBuf,
};

use anyhow::Context as _;
use openraft::SnapshotMeta;
use tracing::{debug, warn};

use crate::{
    fsm::{FileSnapshotSink, KvSnapshot, snapshot::write_image},
    raft::types::{NodeId, NodeMeta},
};

pub type KvSnapshotMeta = SnapshotMeta<NodeId, NodeMeta>;

const META_SUFFIX: &str = ".meta.json";
const DATA_SUFFIX: &str = ".snap.json";

/// Directory of persisted snapshot images.
///
/// Each snapshot is a data file plus a metadata file. The metadata file is written only after the
/// data file has been closed, so a metadata file always points at a complete image.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    fn file_stem(meta: &KvSnapshotMeta) -> String {
        let index = meta.last_log_id.map(|l| l.index).unwrap_or(0);
        format!("snapshot-{index:020}")
    }

    fn data_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{DATA_SUFFIX}"))
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{META_SUFFIX}"))
    }

    /// Open a sink for the data part of the snapshot described by `meta`.
    pub fn create(&self, meta: &KvSnapshotMeta) -> io::Result<FileSnapshotSink> {
        let stem = Self::file_stem(meta);
        FileSnapshotSink::create(meta.snapshot_id.clone(), self.data_path(&stem))
    }

    /// Persist a freshly built snapshot and publish its metadata.
    pub fn save(&self, meta: &KvSnapshotMeta, snapshot: &KvSnapshot) -> anyhow::Result<()> {
        let sink = self.create(meta).context("create snapshot sink")?;
        snapshot.persist(sink)?;
        self.publish(meta)
    }

    /// Persist an image received from the leader.
    pub fn save_bytes(&self, meta: &KvSnapshotMeta, bytes: &[u8]) -> anyhow::Result<()> {
        let sink = self.create(meta).context("create snapshot sink")?;
        write_image(sink, bytes)?;
        self.publish(meta)
    }

    fn publish(&self, meta: &KvSnapshotMeta) -> anyhow::Result<()> {
        let stem = Self::file_stem(meta);
        let path = self.meta_path(&stem);
        let bytes = serde_json::to_vec_pretty(meta).context("encode snapshot meta")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        debug!(snapshot_id = %meta.snapshot_id, path = %path.display(), "snapshot persisted");
        self.prune();
        Ok(())
    }

    fn stems(&self) -> io::Result<Vec<String>> {
        let mut stems = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                stems.push(stem.to_string());
            }
        }
        // Zero-padded indexes: lexical order is index order.
        stems.sort();
        Ok(stems)
    }

    /// Newest complete snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<(KvSnapshotMeta, Vec<u8>)>> {
        let Some(stem) = self.stems()?.pop() else {
            return Ok(None);
        };
        let meta_bytes = fs::read(self.meta_path(&stem))?;
        let meta: KvSnapshotMeta =
            serde_json::from_slice(&meta_bytes).map_err(io::Error::other)?;
        let data = fs::read(self.data_path(&stem))?;
        Ok(Some((meta, data)))
    }

    fn prune(&self) {
        let stems = match self.stems() {
            Ok(stems) => stems,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "list snapshots for pruning");
                return;
            }
        };
        let excess = stems.len().saturating_sub(self.retain);
        for stem in &stems[..excess] {
            for path in [self.meta_path(stem), self.data_path(stem)] {
                if let Err(err) = fs::remove_file(&path)
                    && err.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %err, "remove old snapshot");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, LogId, StoredMembership};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::KvState;

    fn meta(index: u64) -> KvSnapshotMeta {
        SnapshotMeta {
            last_log_id: Some(LogId::new(CommittedLeaderId::new(1, 1), index)),
            last_membership: StoredMembership::default(),
            snapshot_id: format!("snapshot-{index}"),
        }
    }

    fn image(value: &str) -> KvSnapshot {
        KvSnapshot::new(KvState::from([("k".to_string(), value.to_string())]))
    }

    #[test]
    fn latest_returns_newest_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(tmp.path(), 3).unwrap();
        assert!(store.latest().unwrap().is_none());

        store.save(&meta(9), &image("old")).unwrap();
        store.save(&meta(10), &image("new")).unwrap();

        let (meta, bytes) = store.latest().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, "snapshot-10");
        assert_eq!(KvSnapshot::decode(&bytes).unwrap(), image("new"));
    }

    #[test]
    fn retain_limits_kept_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(tmp.path(), 2).unwrap();
        for i in 1..=5 {
            store.save(&meta(i), &image(&i.to_string())).unwrap();
        }
        let files = fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(files, 4);
        assert_eq!(store.latest().unwrap().unwrap().0.snapshot_id, "snapshot-5");
    }

    #[test]
    fn received_image_is_published() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(tmp.path(), 2).unwrap();
        let bytes = image("received").encode().unwrap();
        store.save_bytes(&meta(4), &bytes).unwrap();

        let (meta, data) = store.latest().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, "snapshot-4");
        assert_eq!(data, bytes);
        assert!(!tmp.path().join("snapshot-00000000000000000004.snap.tmp").exists());
    }

    #[test]
    fn unpublished_data_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(tmp.path(), 2).unwrap();
        store.save(&meta(1), &image("published")).unwrap();

        let sink = store.create(&meta(2)).unwrap();
        image("unpublished").persist(sink).unwrap();

        let (meta, bytes) = store.latest().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, "snapshot-1");
        assert_eq!(KvSnapshot::decode(&bytes).unwrap(), image("published"));
    }
}
