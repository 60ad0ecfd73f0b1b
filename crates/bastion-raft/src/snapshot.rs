//! Snapshot production and storage.
//!
//! Snapshots have two origins. FSM-rooted snapshots are the local node
//! acting as its own snapshot: nothing is written to disk, the state machine
//! streams its content on demand under a stable id. File-rooted snapshots
//! arrive from peers during install and are persisted under
//! `<path>/raft/snapshots/<id>/` through a sink that defers all disk work
//! until the first write, so a snapshot handle that is opened and closed
//! without data leaves no artifact.

use std::io::Cursor;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::storage::RaftSnapshotBuilder;
use openraft::storage::Snapshot;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::fsm::configuration_from_membership;
use crate::fsm::Fsm;
use crate::fsm::SnapshotPayload;
use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;

/// Stable id under which the state machine reports itself as a snapshot.
pub const FSM_SNAPSHOT_ID: &str = "fsm-snapshot";

/// File-rooted snapshots kept on disk after reaping.
pub const SNAPSHOT_RETAIN: usize = 2;

/// The only snapshot format this store reads or writes.
pub const SNAPSHOT_VERSION: u32 = 1;

const META_FILENAME: &str = "meta.json";
const DATA_FILENAME: &str = "state.bin";

type SmResult<T> = Result<T, StorageError<NodeId>>;

fn snap_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::read_snapshot(None, &e).into()
}

fn snap_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::write_snapshot(None, &e).into()
}

/// Metadata document persisted next to a file snapshot's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub version: u32,
    pub meta: SnapshotMeta<NodeId, RaftServer>,
    pub size: u64,
}

/// Sink states; see the transition rules on [`FileSnapshotSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    WroteFileBytes,
    Closed,
    Cancelled,
}

/// Write-side of a file-rooted snapshot.
///
/// - `Open -> WroteFileBytes` on first write (lazily creates the artifact)
/// - `Open -> Closed` on close with no writes: no artifact remains
/// - `WroteFileBytes -> Closed` on close: finalize and retain
/// - any state `-> Cancelled` on cancel: partial artifacts removed
pub struct FileSnapshotSink {
    id: String,
    final_dir: PathBuf,
    tmp_dir: PathBuf,
    meta: SnapshotMeta<NodeId, RaftServer>,
    state: SinkState,
    file: Option<std::fs::File>,
    bytes_written: u64,
}

impl FileSnapshotSink {
    fn new(store_dir: &Path, meta: SnapshotMeta<NodeId, RaftServer>) -> Self {
        let id = format!(
            "file-{}-{}-{}",
            meta.last_log_id.map(|l| l.leader_id.term).unwrap_or(0),
            meta.last_log_id.map(|l| l.index).unwrap_or(0),
            &uuid::Uuid::new_v4().to_string()[..8],
        );
        Self {
            final_dir: store_dir.join(&id),
            tmp_dir: store_dir.join(format!("{id}.tmp")),
            id,
            meta,
            state: SinkState::Open,
            file: None,
            bytes_written: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Append snapshot bytes, creating the artifact on first use.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        match self.state {
            SinkState::Open => {
                std::fs::create_dir_all(&self.tmp_dir)?;
                let file = std::fs::File::create(self.tmp_dir.join(DATA_FILENAME))?;
                self.file = Some(file);
                self.state = SinkState::WroteFileBytes;
            }
            SinkState::WroteFileBytes => {}
            SinkState::Closed | SinkState::Cancelled => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "snapshot sink is finished",
                ));
            }
        }
        let file = self.file.as_mut().expect("file exists in WroteFileBytes");
        file.write_all(buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Finalize the sink. With no writes there is nothing to retain; with
    /// writes the artifact is fsynced and moved into place.
    pub fn close(mut self) -> Result<Option<PathBuf>, std::io::Error> {
        match self.state {
            SinkState::Open => {
                self.state = SinkState::Closed;
                Ok(None)
            }
            SinkState::WroteFileBytes => {
                let file = self.file.take().expect("file exists in WroteFileBytes");
                file.sync_data()?;
                drop(file);

                let document = SnapshotDocument {
                    version: SNAPSHOT_VERSION,
                    meta: self.meta.clone(),
                    size: self.bytes_written,
                };
                let meta_bytes =
                    serde_json::to_vec_pretty(&document).map_err(std::io::Error::other)?;
                std::fs::write(self.tmp_dir.join(META_FILENAME), meta_bytes)?;

                std::fs::rename(&self.tmp_dir, &self.final_dir)?;
                if let Some(parent) = self.final_dir.parent() {
                    std::fs::File::open(parent)?.sync_all()?;
                }
                self.state = SinkState::Closed;
                Ok(Some(self.final_dir.clone()))
            }
            SinkState::Closed | SinkState::Cancelled => Ok(None),
        }
    }

    /// Abort the sink, removing any partial artifact.
    pub fn cancel(mut self) -> Result<(), std::io::Error> {
        self.file = None;
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        self.state = SinkState::Cancelled;
        Ok(())
    }
}

/// Snapshot store: FSM-rooted current snapshot plus file-rooted installs.
pub struct SnapshotStore {
    dir: PathBuf,
    fsm: Arc<Fsm>,
    delay: Option<Duration>,
}

impl SnapshotStore {
    /// Open the store and reap stale file snapshots from previous runs, so
    /// they can never win over current FSM state.
    pub fn open(dir: impl Into<PathBuf>, fsm: Arc<Fsm>, delay: Option<Duration>) -> Result<Self, std::io::Error> {
        let store = Self {
            dir: dir.into(),
            fsm,
            delay,
        };
        std::fs::create_dir_all(&store.dir)?;
        store.reap_snapshots()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Available snapshots: exactly one FSM-rooted snapshot once the state
    /// machine has applied anything, none before.
    pub fn list(&self) -> Result<Vec<SnapshotDocument>, std::io::Error> {
        let (latest, _) = self.fsm.latest_state();
        if latest.index == 0 {
            return Ok(Vec::new());
        }
        let (document, _) = self.fsm_snapshot_document()?;
        Ok(vec![document])
    }

    /// Open a snapshot for reading: the stable FSM-rooted id streams current
    /// state (size metered while serializing); other ids resolve to retained
    /// file snapshots.
    pub fn open_snapshot(&self, id: &str) -> Result<(SnapshotDocument, Vec<u8>), std::io::Error> {
        if id == FSM_SNAPSHOT_ID {
            return self.fsm_snapshot_document();
        }
        let dir = self.dir.join(id);
        let meta_bytes = std::fs::read(dir.join(META_FILENAME))?;
        let document: SnapshotDocument =
            serde_json::from_slice(&meta_bytes).map_err(std::io::Error::other)?;
        if document.version != SNAPSHOT_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported snapshot version {}", document.version),
            ));
        }
        let data = std::fs::read(dir.join(DATA_FILENAME))?;
        Ok((document, data))
    }

    fn fsm_snapshot_document(&self) -> Result<(SnapshotDocument, Vec<u8>), std::io::Error> {
        let payload = self
            .fsm
            .snapshot_payload()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let bytes = bincode::serialize(&payload).map_err(std::io::Error::other)?;
        let document = SnapshotDocument {
            version: SNAPSHOT_VERSION,
            meta: SnapshotMeta {
                last_log_id: payload.last_log_id,
                last_membership: payload.membership.clone(),
                snapshot_id: FSM_SNAPSHOT_ID.to_string(),
            },
            size: bytes.len() as u64,
        };
        Ok((document, bytes))
    }

    /// Create a sink for a snapshot arriving from a peer.
    pub fn create_sink(&self, meta: &SnapshotMeta<NodeId, RaftServer>) -> FileSnapshotSink {
        FileSnapshotSink::new(&self.dir, meta.clone())
    }

    /// Delete file snapshots beyond the retained count, oldest first.
    pub fn reap_snapshots(&self) -> Result<(), std::io::Error> {
        let mut dirs = Vec::new();
        for item in std::fs::read_dir(&self.dir)? {
            let item = item?;
            let path = item.path();
            if !item.file_type()?.is_dir() {
                continue;
            }
            // Unfinished sinks from a crashed install are reaped outright.
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                std::fs::remove_dir_all(&path)?;
                continue;
            }
            let modified = item.metadata()?.modified()?;
            dirs.push((modified, path));
        }
        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in dirs.into_iter().skip(SNAPSHOT_RETAIN) {
            debug!(path = %path.display(), "reaping file snapshot");
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// The current snapshot the raft engine may send to peers: the state
    /// machine itself, serialized on demand.
    pub(crate) fn current_snapshot(&self) -> SmResult<Option<Snapshot<TypeConfig>>> {
        let (latest, _) = self.fsm.latest_state();
        if latest.index == 0 {
            return Ok(None);
        }
        let (document, bytes) = self.fsm_snapshot_document().map_err(snap_read_err)?;
        Ok(Some(Snapshot {
            meta: document.meta,
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }

    /// Install a snapshot received from a peer: persist it through a file
    /// sink, then atomically replace the state machine's content.
    pub(crate) async fn install(
        &self,
        meta: &SnapshotMeta<NodeId, RaftServer>,
        data: Vec<u8>,
    ) -> SmResult<()> {
        let payload: SnapshotPayload = bincode::deserialize(&data).map_err(|e| {
            let io = std::io::Error::other(e);
            StorageError::from(StorageIOError::read_snapshot(Some(meta.signature()), &io))
        })?;

        let mut sink = self.create_sink(meta);
        sink.write(&data).map_err(snap_write_err)?;
        let persisted = sink.close().map_err(snap_write_err)?;

        self.fsm
            .restore_from_payload(&payload)
            .map_err(|e| snap_write_err(std::io::Error::other(e.to_string())))?;

        let configuration = configuration_from_membership(&payload.membership);
        let configuration_index = configuration.index;
        self.fsm
            .witness_snapshot(
                meta.last_log_id.map(|l| l.index).unwrap_or(0),
                meta.last_log_id.map(|l| l.leader_id.term).unwrap_or(0),
                configuration_index,
                Some(configuration),
            )
            .map_err(|e| snap_write_err(std::io::Error::other(e.to_string())))?;

        if let Err(e) = self.reap_snapshots() {
            warn!(error = %e, "failed to reap file snapshots after install");
        }

        info!(
            snapshot_id = %meta.snapshot_id,
            index = meta.last_log_id.map(|l| l.index).unwrap_or(0),
            path = persisted.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            "installed snapshot from peer"
        );
        Ok(())
    }
}

/// Builds FSM-rooted snapshots for the raft engine.
pub struct SnapshotBuilder {
    fsm: Arc<Fsm>,
    store: Arc<SnapshotStore>,
}

impl SnapshotBuilder {
    pub(crate) fn new(fsm: Arc<Fsm>, store: Arc<SnapshotStore>) -> Self {
        Self { fsm, store }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> SmResult<Snapshot<TypeConfig>> {
        if let Some(delay) = self.store.delay {
            tokio::time::sleep(delay).await;
        }

        let payload = self
            .fsm
            .snapshot_payload()
            .map_err(|e| snap_read_err(std::io::Error::other(e.to_string())))?;
        let bytes = bincode::serialize(&payload).map_err(snap_read_err)?;

        // Record the snapshot's view of latest state, covering entry types
        // that never pass through apply.
        let configuration = configuration_from_membership(&payload.membership);
        self.fsm
            .witness_snapshot(
                payload.last_log_id.map(|l| l.index).unwrap_or(0),
                payload.last_log_id.map(|l| l.leader_id.term).unwrap_or(0),
                configuration.index,
                Some(configuration),
            )
            .map_err(|e| snap_read_err(std::io::Error::other(e.to_string())))?;

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: payload.last_log_id,
                last_membership: payload.membership.clone(),
                snapshot_id: FSM_SNAPSHOT_ID.to_string(),
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}
