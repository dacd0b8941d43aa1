use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::KvState;

/// Point-in-time copy of the whole key/value state.
///
/// Built from a deep copy, so writes applied after it was taken never show up in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSnapshot {
    pub data: KvState,
}

impl KvSnapshot {
    pub fn new(data: KvState) -> Self {
        Self { data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Write this snapshot into `sink`.
    ///
    /// A serialization or write failure cancels the sink so no half-written image is kept;
    /// success closes it, which finalizes the image.
    pub fn persist<S: SnapshotSink>(&self, sink: S) -> anyhow::Result<()> {
        let bytes = match self.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                cancel_quietly(sink);
                return Err(anyhow::Error::new(err).context("encode snapshot"));
            }
        };
        write_image(sink, &bytes)
    }
}

/// Write an already encoded image into `sink`, closing it on success and cancelling it on failure.
pub fn write_image<S: SnapshotSink>(mut sink: S, bytes: &[u8]) -> anyhow::Result<()> {
    if let Err(err) = sink.write_all(bytes).and_then(|_| sink.flush()) {
        cancel_quietly(sink);
        return Err(anyhow::Error::new(err).context("write snapshot to sink"));
    }

    sink.close().context("close snapshot sink")?;
    Ok(())
}

fn cancel_quietly<S: SnapshotSink>(sink: S) {
    let id = sink.id().to_string();
    if let Err(err) = sink.cancel() {
        warn!(snapshot_id = %id, error = %err, "cancel snapshot sink");
    }
}

/// Destination of a snapshot image.
///
/// Bytes written are not visible to readers until `close` succeeds. `cancel` discards them.
pub trait SnapshotSink: Write {
    fn id(&self) -> &str;

    fn close(self) -> io::Result<()>;

    fn cancel(self) -> io::Result<()>;
}

/// Sink writing to `<final>.tmp` and renaming onto the final path on close.
#[derive(Debug)]
pub struct FileSnapshotSink {
    id: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: fs::File,
}

impl FileSnapshotSink {
    pub fn create(id: impl Into<String>, final_path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = final_path.with_extension("tmp");
        let file = fs::File::create(&tmp_path)?;
        Ok(Self {
            id: id.into(),
            tmp_path,
            final_path,
            file,
        })
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(self) -> io::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        fs::rename(&self.tmp_path, &self.final_path)
    }

    fn cancel(self) -> io::Result<()> {
        drop(self.file);
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
