//! Persistent raft log and stable store.
//!
//! `RedbLogStore` keeps log entries and raft-internal state (vote, committed
//! index, purge marker, removal flag) in a single redb file under
//! `<path>/raft/raft.db`. Entries are opaque bincode blobs keyed by index.
//! `LogStore` is the backend-selected variant: redb by default, the
//! write-ahead log when `raft_wal` is configured.

use std::fmt::Debug;
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
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::NodeId;
use crate::types::TypeConfig;
use crate::wal::WalLogStore;

/// Log entries: key = log index, value = bincode-encoded entry.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("logs");

/// Raft-internal state: `vote`, `committed`, `last_purged`, `removed`.
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";
const REMOVED_KEY: &str = "removed";

type LogResult<T> = Result<T, StorageError<NodeId>>;

fn read_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::read_logs(&e).into()
}

fn write_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::write_logs(&e).into()
}

/// redb-backed raft log store. Cheap to clone; clones share the database.
#[derive(Clone)]
pub struct RedbLogStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl Debug for RedbLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLogStore").field("path", &self.path).finish()
    }
}

impl RedbLogStore {
    /// Open or create the log database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path).map_err(std::io::Error::other)?;

        let txn = db.begin_write().map_err(std::io::Error::other)?;
        {
            txn.open_table(LOG_TABLE).map_err(std::io::Error::other)?;
            txn.open_table(META_TABLE).map_err(std::io::Error::other)?;
        }
        txn.commit().map_err(std::io::Error::other)?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, std::io::Error> {
        let txn = self.db.begin_read().map_err(std::io::Error::other)?;
        let table = txn.open_table(META_TABLE).map_err(std::io::Error::other)?;
        match table.get(key).map_err(std::io::Error::other)? {
            Some(raw) => Ok(Some(bincode::deserialize(raw.value()).map_err(std::io::Error::other)?)),
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), std::io::Error> {
        let txn = self.db.begin_write().map_err(std::io::Error::other)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(std::io::Error::other)?;
            let bytes = bincode::serialize(value).map_err(std::io::Error::other)?;
            table.insert(key, bytes.as_slice()).map_err(std::io::Error::other)?;
        }
        txn.commit().map_err(std::io::Error::other)?;
        Ok(())
    }

    /// True when any raft state exists: a vote or at least one log entry.
    /// Decides whether a fresh node may bootstrap itself.
    pub fn has_state(&self) -> Result<bool, std::io::Error> {
        if self.read_meta::<Vote<NodeId>>(VOTE_KEY)?.is_some() {
            return Ok(true);
        }
        let txn = self.db.begin_read().map_err(std::io::Error::other)?;
        let table = txn.open_table(LOG_TABLE).map_err(std::io::Error::other)?;
        let has_last = table.last().map_err(std::io::Error::other)?.is_some();
        Ok(has_last)
    }

    /// Whether this node has been removed from the cluster.
    pub fn is_removed(&self) -> bool {
        self.read_meta::<bool>(REMOVED_KEY).ok().flatten().unwrap_or(false)
    }

    /// Persist the removal marker.
    pub fn set_removed(&self, removed: bool) -> Result<(), std::io::Error> {
        self.write_meta(REMOVED_KEY, &removed)
    }

    fn last_log_id(&self) -> Result<Option<LogId<NodeId>>, std::io::Error> {
        let txn = self.db.begin_read().map_err(std::io::Error::other)?;
        let table = txn.open_table(LOG_TABLE).map_err(std::io::Error::other)?;
        let last = table.last().map_err(std::io::Error::other)?;
        match last {
            Some((_, raw)) => {
                let entry: openraft::Entry<TypeConfig> =
                    bincode::deserialize(raw.value()).map_err(std::io::Error::other)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }
}

impl RaftLogReader<TypeConfig> for RedbLogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> LogResult<Vec<openraft::Entry<TypeConfig>>>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        let txn = self.db.begin_read().map_err(read_logs_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_logs_err)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_logs_err)? {
            let (_, raw) = item.map_err(read_logs_err)?;
            let entry: openraft::Entry<TypeConfig> =
                bincode::deserialize(raw.value()).map_err(read_logs_err)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RedbLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> LogResult<LogState<TypeConfig>> {
        let last_purged: Option<LogId<NodeId>> =
            self.read_meta(LAST_PURGED_KEY).map_err(read_logs_err)?;
        let last_log_id = self.last_log_id().map_err(read_logs_err)?.or(last_purged);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> LogResult<()> {
        self.write_meta(COMMITTED_KEY, &committed).map_err(write_logs_err)
    }

    async fn read_committed(&mut self) -> LogResult<Option<LogId<NodeId>>> {
        Ok(self.read_meta(COMMITTED_KEY).map_err(read_logs_err)?.flatten())
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> LogResult<()> {
        self.write_meta(VOTE_KEY, vote)
            .map_err(|e| StorageIOError::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> LogResult<Option<Vote<NodeId>>> {
        self.read_meta(VOTE_KEY).map_err(read_logs_err)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> LogResult<()>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let result = (|| -> Result<(), std::io::Error> {
            let txn = self.db.begin_write().map_err(std::io::Error::other)?;
            {
                let mut table = txn.open_table(LOG_TABLE).map_err(std::io::Error::other)?;
                for entry in entries {
                    let bytes = bincode::serialize(&entry).map_err(std::io::Error::other)?;
                    table
                        .insert(entry.log_id.index, bytes.as_slice())
                        .map_err(std::io::Error::other)?;
                }
            }
            // redb commits durably; the flush callback fires only after.
            txn.commit().map_err(std::io::Error::other)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                callback.log_io_completed(Ok(()));
                Ok(())
            }
            Err(e) => {
                let err = write_logs_err(e);
                callback.log_io_completed(Err(std::io::Error::other(err.to_string())));
                Err(err)
            }
        }
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_logs_err)?;
            let doomed = collect_keys(&table, log_id.index..).map_err(write_logs_err)?;
            for index in doomed {
                table.remove(index).map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        self.write_meta(LAST_PURGED_KEY, &Some(log_id)).map_err(write_logs_err)?;
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_logs_err)?;
            let doomed = collect_keys(&table, ..=log_id.index).map_err(write_logs_err)?;
            for index in doomed {
                table.remove(index).map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

fn collect_keys(
    table: &impl ReadableTable<u64, &'static [u8]>,
    range: impl RangeBounds<u64>,
) -> Result<Vec<u64>, redb::StorageError> {
    let mut keys = Vec::new();
    for item in table.range(range)? {
        let (key, _) = item?;
        keys.push(key.value());
    }
    Ok(keys)
}

/// Backend-selected log store implementation.
#[derive(Debug, Clone)]
pub enum LogStore {
    Redb(RedbLogStore),
    Wal(WalLogStore),
}

impl LogStore {
    pub fn has_state(&self) -> Result<bool, std::io::Error> {
        match self {
            LogStore::Redb(store) => store.has_state(),
            LogStore::Wal(store) => store.has_state(),
        }
    }

    pub fn is_removed(&self) -> bool {
        match self {
            LogStore::Redb(store) => store.is_removed(),
            LogStore::Wal(store) => store.is_removed(),
        }
    }

    pub fn set_removed(&self, removed: bool) -> Result<(), std::io::Error> {
        match self {
            LogStore::Redb(store) => store.set_removed(removed),
            LogStore::Wal(store) => store.set_removed(removed),
        }
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> LogResult<Vec<openraft::Entry<TypeConfig>>>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        match self {
            LogStore::Redb(store) => store.try_get_log_entries(range).await,
            LogStore::Wal(store) => store.try_get_log_entries(range).await,
        }
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> LogResult<LogState<TypeConfig>> {
        match self {
            LogStore::Redb(store) => store.get_log_state().await,
            LogStore::Wal(store) => store.get_log_state().await,
        }
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> LogResult<()> {
        match self {
            LogStore::Redb(store) => store.save_committed(committed).await,
            LogStore::Wal(store) => store.save_committed(committed).await,
        }
    }

    async fn read_committed(&mut self) -> LogResult<Option<LogId<NodeId>>> {
        match self {
            LogStore::Redb(store) => store.read_committed().await,
            LogStore::Wal(store) => store.read_committed().await,
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> LogResult<()> {
        match self {
            LogStore::Redb(store) => store.save_vote(vote).await,
            LogStore::Wal(store) => store.save_vote(vote).await,
        }
    }

    async fn read_vote(&mut self) -> LogResult<Option<Vote<NodeId>>> {
        match self {
            LogStore::Redb(store) => store.read_vote().await,
            LogStore::Wal(store) => store.read_vote().await,
        }
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> LogResult<()>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        match self {
            LogStore::Redb(store) => store.append(entries, callback).await,
            LogStore::Wal(store) => store.append(entries, callback).await,
        }
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        match self {
            LogStore::Redb(store) => store.truncate(log_id).await,
            LogStore::Wal(store) => store.truncate(log_id).await,
        }
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> LogResult<()> {
        match self {
            LogStore::Redb(store) => store.purge(log_id).await,
            LogStore::Wal(store) => store.purge(log_id).await,
        }
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
            payload: EntryPayload::Normal(format!("payload-{index}").into_bytes()),
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();

        store.blocking_append([entry(1, 1), entry(1, 2), entry(1, 3)]).await.unwrap();

        let entries = store.try_get_log_entries(1..=3).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].log_id.index, 3);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 3);
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn vote_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.db");
        let vote = Vote::new(7, 42);
        {
            let mut store = RedbLogStore::open(&path).unwrap();
            store.save_vote(&vote).await.unwrap();
        }
        let mut store = RedbLogStore::open(&path).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
        assert!(store.has_state().unwrap());
    }

    #[tokio::test]
    async fn truncate_removes_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        store
            .blocking_append((1..=5).map(|i| entry(1, i)).collect::<Vec<_>>())
            .await
            .unwrap();

        store.truncate(test_log_id(1, 3)).await.unwrap();
        let entries = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.last().unwrap().log_id.index, 2);
    }

    #[tokio::test]
    async fn purge_removes_prefix_and_remembers_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        store
            .blocking_append((1..=5).map(|i| entry(1, i)).collect::<Vec<_>>())
            .await
            .unwrap();

        store.purge(test_log_id(1, 3)).await.unwrap();
        let entries = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.first().unwrap().log_id.index, 4);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 3);
        assert_eq!(state.last_log_id.unwrap().index, 5);
    }

    #[tokio::test]
    async fn removed_marker_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        assert!(!store.is_removed());
        store.set_removed(true).unwrap();
        assert!(store.is_removed());
    }
}
