//! Write-ahead-log variant of the raft log store.
//!
//! Selected by the `raft_wal` option. Observable contract is identical to
//! the redb store: entries keyed by index, durable vote/committed/purge
//! state. Records are framed onto a single append-only file under
//! `<path>/raft/wal/`; reads are served from an in-memory mirror rebuilt by
//! replay on open. Dead bytes from truncation and purging are reclaimed by
//! rewriting the live tail to a fresh file once they cross a threshold.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::ops::RangeBounds;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::storage::LogFlushed;
use openraft::storage::LogState;
use openraft::storage::RaftLogStorage;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::RaftLogReader;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::Vote;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::types::NodeId;
use crate::types::TypeConfig;

const WAL_FILENAME: &str = "wal.log";

/// Rewrite the file once dead bytes exceed this many bytes.
const COMPACTION_THRESHOLD: u64 = 16 * 1024 * 1024;

type LogResult<T> = Result<T, StorageError<NodeId>>;

fn read_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::read_logs(&e).into()
}

fn write_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::write_logs(&e).into()
}

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    /// A log entry, bincode-encoded.
    Entry { index: u64, data: Vec<u8> },
    /// Remove entries at and above `index`.
    Truncate { index: u64 },
    /// Remove entries at and below the purged log id.
    Purge { log_id: LogId<NodeId> },
    Vote(Vote<NodeId>),
    Committed(Option<LogId<NodeId>>),
    Removed(bool),
}

struct WalInner {
    dir: PathBuf,
    file: File,
    entries: BTreeMap<u64, Vec<u8>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    removed: bool,
    dead_bytes: u64,
}

/// Segmented append-only raft log store.
#[derive(Clone)]
pub struct WalLogStore {
    inner: Arc<Mutex<WalInner>>,
}

impl Debug for WalLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalLogStore").finish_non_exhaustive()
    }
}

impl WalLogStore {
    /// Open or create the write-ahead log under `dir`, replaying existing
    /// records. A torn final frame (crash mid-append) is discarded.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_FILENAME);

        let mut inner = WalInner {
            dir,
            file: OpenOptions::new().create(true).append(true).read(true).open(&path)?,
            entries: BTreeMap::new(),
            vote: None,
            committed: None,
            last_purged: None,
            removed: false,
            dead_bytes: 0,
        };
        inner.replay(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn has_state(&self) -> Result<bool, std::io::Error> {
        let inner = self.inner.lock();
        Ok(inner.vote.is_some() || !inner.entries.is_empty() || inner.last_purged.is_some())
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn set_removed(&self, removed: bool) -> Result<(), std::io::Error> {
        let mut inner = self.inner.lock();
        inner.append_record(&WalRecord::Removed(removed))?;
        inner.removed = removed;
        Ok(())
    }
}

impl WalInner {
    fn replay(&mut self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut offset = 0usize;
        let mut live_bytes = 0u64;
        while buf.len() - offset >= 12 {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            let frame_end = offset + 12 + len;
            if frame_end > buf.len() {
                warn!(offset, "discarding torn tail frame in write-ahead log");
                break;
            }
            let stored_sum = u64::from_le_bytes(buf[offset + 4..offset + 12].try_into().unwrap());
            let payload = &buf[offset + 12..frame_end];
            if frame_checksum(payload) != stored_sum {
                warn!(offset, "discarding corrupt tail of write-ahead log");
                break;
            }
            let record: WalRecord = bincode::deserialize(payload).map_err(std::io::Error::other)?;
            match record {
                WalRecord::Entry { index, data } => {
                    live_bytes += data.len() as u64;
                    self.entries.insert(index, data);
                }
                WalRecord::Truncate { index } => {
                    self.entries.split_off(&index);
                }
                WalRecord::Purge { log_id } => {
                    let kept = self.entries.split_off(&(log_id.index + 1));
                    self.entries = kept;
                    self.last_purged = Some(log_id);
                }
                WalRecord::Vote(vote) => self.vote = Some(vote),
                WalRecord::Committed(committed) => self.committed = committed,
                WalRecord::Removed(removed) => self.removed = removed,
            }
            offset = frame_end;
        }
        self.dead_bytes = (offset as u64).saturating_sub(live_bytes);
        Ok(())
    }

    fn append_record(&mut self, record: &WalRecord) -> Result<(), std::io::Error> {
        let payload = bincode::serialize(record).map_err(std::io::Error::other)?;
        let mut frame = Vec::with_capacity(12 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&frame_checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Rewrite live state to a fresh file and swap it in.
    fn compact(&mut self) -> Result<(), std::io::Error> {
        let path = self.dir.join(WAL_FILENAME);
        let tmp = self.dir.join(format!("{WAL_FILENAME}.compact"));

        {
            let mut out = File::create(&tmp)?;
            let mut write = |record: &WalRecord| -> Result<(), std::io::Error> {
                let payload = bincode::serialize(record).map_err(std::io::Error::other)?;
                out.write_all(&(payload.len() as u32).to_le_bytes())?;
                out.write_all(&frame_checksum(&payload).to_le_bytes())?;
                out.write_all(&payload)?;
                Ok(())
            };
            if let Some(vote) = self.vote {
                write(&WalRecord::Vote(vote))?;
            }
            write(&WalRecord::Committed(self.committed))?;
            if let Some(log_id) = self.last_purged {
                write(&WalRecord::Purge { log_id })?;
            }
            write(&WalRecord::Removed(self.removed))?;
            for (index, data) in &self.entries {
                write(&WalRecord::Entry {
                    index: *index,
                    data: data.clone(),
                })?;
            }
            out.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;
        self.file = OpenOptions::new().append(true).read(true).open(&path)?;
        self.dead_bytes = 0;
        info!(entries = self.entries.len(), "compacted write-ahead log");
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), std::io::Error> {
        if self.dead_bytes >= COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }
}

fn frame_checksum(payload: &[u8]) -> u64 {
    let digest = blake3::hash(payload);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

impl RaftLogReader<TypeConfig> for WalLogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> LogResult<Vec<openraft::Entry<TypeConfig>>>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        let inner = self.inner.lock();
        inner
            .entries
            .range(range)
            .map(|(_, data)| bincode::deserialize(data).map_err(read_logs_err))
            .collect()
    }
}

impl RaftLogStorage<TypeConfig> for WalLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> LogResult<LogState<TypeConfig>> {
        let inner = self.inner.lock();
        let last_in_log = match inner.entries.iter().next_back() {
            Some((_, data)) => {
                let entry: openraft::Entry<TypeConfig> =
                    bincode::deserialize(data).map_err(read_logs_err)?;
                Some(entry.log_id)
            }
            None => None,
        };
        Ok(LogState {
            last_purged_log_id: inner.last_purged,
            last_log_id: last_in_log.or(inner.last_purged),
        })
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.append_record(&WalRecord::Committed(committed)).map_err(write_logs_err)?;
        inner.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> LogResult<Option<LogId<NodeId>>> {
        Ok(self.inner.lock().committed)
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner
            .append_record(&WalRecord::Vote(*vote))
            .map_err(|e| -> StorageError<NodeId> { StorageIOError::write_vote(&e).into() })?;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> LogResult<Option<Vote<NodeId>>> {
        Ok(self.inner.lock().vote)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> LogResult<()>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let result = (|| -> Result<(), std::io::Error> {
            let mut inner = self.inner.lock();
            for entry in entries {
                let data = bincode::serialize(&entry).map_err(std::io::Error::other)?;
                inner.append_record(&WalRecord::Entry {
                    index: entry.log_id.index,
                    data: data.clone(),
                })?;
                if let Some(old) = inner.entries.insert(entry.log_id.index, data) {
                    inner.dead_bytes += old.len() as u64;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                callback.log_io_completed(Ok(()));
                Ok(())
            }
            Err(e) => {
                callback.log_io_completed(Err(std::io::Error::other(e.to_string())));
                Err(write_logs_err(e))
            }
        }
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner
            .append_record(&WalRecord::Truncate { index: log_id.index })
            .map_err(write_logs_err)?;
        let dropped = inner.entries.split_off(&log_id.index);
        inner.dead_bytes += dropped.values().map(|d| d.len() as u64).sum::<u64>();
        inner.maybe_compact().map_err(write_logs_err)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.append_record(&WalRecord::Purge { log_id }).map_err(write_logs_err)?;
        let kept = inner.entries.split_off(&(log_id.index + 1));
        let dropped = std::mem::replace(&mut inner.entries, kept);
        inner.dead_bytes += dropped.values().map(|d| d.len() as u64).sum::<u64>();
        inner.last_purged = Some(log_id);
        inner.maybe_compact().map_err(write_logs_err)?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use openraft::storage::RaftLogStorageExt;
    use openraft::EntryPayload;

    use super::*;
    use crate::fsm::test_log_id;

    fn entry(term: u64, index: u64) -> openraft::Entry<TypeConfig> {
        openraft::Entry {
            log_id: test_log_id(term, index),
            payload: EntryPayload::Normal(vec![index as u8; 8]),
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vote = Vote::new(3, 9);
        {
            let mut store = WalLogStore::open(dir.path()).unwrap();
            store.blocking_append((1..=4).map(|i| entry(1, i)).collect::<Vec<_>>()).await.unwrap();
            store.save_vote(&vote).await.unwrap();
            store.truncate(test_log_id(1, 4)).await.unwrap();
            store.purge(test_log_id(1, 1)).await.unwrap();
        }

        let mut store = WalLogStore::open(dir.path()).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
        let entries = store.try_get_log_entries(..).await.unwrap();
        let indexes: Vec<u64> = entries.iter().map(|e| e.log_id.index).collect();
        assert_eq!(indexes, vec![2, 3]);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 1);
        assert_eq!(state.last_log_id.unwrap().index, 3);
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = WalLogStore::open(dir.path()).unwrap();
            store.blocking_append([entry(1, 1), entry(1, 2)]).await.unwrap();
        }
        // Simulate a crash mid-append: half a frame of garbage at the tail.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(WAL_FILENAME))
                .unwrap();
            file.write_all(&[0xFF, 0x00, 0x00, 0x00, 0xAA]).unwrap();
        }

        let mut store = WalLogStore::open(dir.path()).unwrap();
        let entries = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn compaction_preserves_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = WalLogStore::open(dir.path()).unwrap();
        store.blocking_append((1..=10).map(|i| entry(1, i)).collect::<Vec<_>>()).await.unwrap();
        store.save_committed(Some(test_log_id(1, 10))).await.unwrap();

        store.inner.lock().compact().unwrap();

        let mut reopened = WalLogStore::open(dir.path()).unwrap();
        assert_eq!(reopened.try_get_log_entries(..).await.unwrap().len(), 10);
        assert_eq!(reopened.read_committed().await.unwrap().unwrap().index, 10);
    }
}
