//! Read-through LRU cache over a raft log store.
//!
//! Recently appended entries are the ones the engine re-reads for
//! replication, so a small fixed cache absorbs most log reads. The cache is
//! write-through on append and invalidates on truncate/purge.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;

use lru::LruCache;
use openraft::storage::LogFlushed;
use openraft::storage::LogState;
use openraft::storage::RaftLogStorage;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::RaftLogReader;
use openraft::StorageError;
use openraft::Vote;
use parking_lot::Mutex;

use crate::types::NodeId;
use crate::types::TypeConfig;

/// Number of log entries held in memory.
pub const LOG_CACHE_SIZE: usize = 512;

/// LRU-cached log store wrapper. Clones share the cache.
#[derive(Clone)]
pub struct CachedLogStore<S> {
    inner: S,
    cache: Arc<Mutex<LruCache<u64, openraft::Entry<TypeConfig>>>>,
}

impl<S: Debug> Debug for CachedLogStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedLogStore").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S> CachedLogStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, LOG_CACHE_SIZE)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero cache capacity");
        Self {
            inner,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Serve the whole range from cache, or `None` on any miss.
    fn cached_range<RB: RangeBounds<u64>>(&self, range: &RB) -> Option<Vec<openraft::Entry<TypeConfig>>> {
        let start = match range.start_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(i) => i.checked_add(1)?,
            Bound::Unbounded => return None,
        };
        let end = match range.end_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(i) => i.checked_sub(1)?,
            Bound::Unbounded => return None,
        };
        if end < start {
            return Some(Vec::new());
        }

        let mut cache = self.cache.lock();
        let mut entries = Vec::with_capacity((end - start + 1) as usize);
        for index in start..=end {
            entries.push(cache.get(&index)?.clone());
        }
        Some(entries)
    }

    fn invalidate_from(&self, index: u64) {
        let mut cache = self.cache.lock();
        let doomed: Vec<u64> = cache.iter().map(|(k, _)| *k).filter(|k| *k >= index).collect();
        for key in doomed {
            cache.pop(&key);
        }
    }

    fn invalidate_through(&self, index: u64) {
        let mut cache = self.cache.lock();
        let doomed: Vec<u64> = cache.iter().map(|(k, _)| *k).filter(|k| *k <= index).collect();
        for key in doomed {
            cache.pop(&key);
        }
    }
}

impl<S> RaftLogReader<TypeConfig> for CachedLogStore<S>
where
    S: RaftLogReader<TypeConfig>,
{
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<openraft::Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        if let Some(entries) = self.cached_range(&range) {
            return Ok(entries);
        }
        let entries = self.inner.try_get_log_entries(range).await?;
        let mut cache = self.cache.lock();
        for entry in &entries {
            cache.put(entry.log_id.index, entry.clone());
        }
        Ok(entries)
    }
}

impl<S> RaftLogStorage<TypeConfig> for CachedLogStore<S>
where
    S: RaftLogStorage<TypeConfig> + RaftLogReader<TypeConfig> + Clone,
{
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        self.inner.get_log_state().await
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.inner.save_committed(committed).await
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.inner.read_committed().await
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.inner.save_vote(vote).await
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.inner.read_vote().await
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        {
            let mut cache = self.cache.lock();
            for entry in &entries {
                cache.put(entry.log_id.index, entry.clone());
            }
        }
        self.inner.append(entries, callback).await
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.invalidate_from(log_id.index);
        self.inner.truncate(log_id).await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.invalidate_through(log_id.index);
        self.inner.purge(log_id).await
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
    use crate::log_store::RedbLogStore;

    fn entry(index: u64) -> openraft::Entry<TypeConfig> {
        openraft::Entry {
            log_id: test_log_id(1, index),
            payload: EntryPayload::Normal(vec![index as u8]),
        }
    }

    #[tokio::test]
    async fn bounded_reads_hit_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        let mut cached = CachedLogStore::with_capacity(store, 8);

        cached.blocking_append((1..=5).map(entry).collect::<Vec<_>>()).await.unwrap();
        assert!(cached.cached_range(&(1..=5)).is_some());

        let entries = cached.try_get_log_entries(2..=4).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].log_id.index, 2);
    }

    #[tokio::test]
    async fn eviction_falls_back_to_inner_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        let mut cached = CachedLogStore::with_capacity(store, 2);

        cached.blocking_append((1..=5).map(entry).collect::<Vec<_>>()).await.unwrap();
        // Only the two most recent entries fit.
        assert!(cached.cached_range(&(1..=1)).is_none());

        let entries = cached.try_get_log_entries(1..=5).await.unwrap();
        assert_eq!(entries.len(), 5);
    }

    #[tokio::test]
    async fn truncate_invalidates_cached_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        let mut cached = CachedLogStore::with_capacity(store, 8);

        cached.blocking_append((1..=5).map(entry).collect::<Vec<_>>()).await.unwrap();
        cached.truncate(test_log_id(1, 3)).await.unwrap();

        assert!(cached.cached_range(&(3..=5)).is_none());
        let entries = cached.try_get_log_entries(1..).await.unwrap();
        assert_eq!(entries.last().unwrap().log_id.index, 2);
    }

    #[tokio::test]
    async fn purge_invalidates_cached_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        let mut cached = CachedLogStore::with_capacity(store, 8);

        cached.blocking_append((1..=5).map(entry).collect::<Vec<_>>()).await.unwrap();
        cached.purge(test_log_id(1, 2)).await.unwrap();

        assert!(cached.cached_range(&(1..=2)).is_none());
        let entries = cached.try_get_log_entries(..).await.unwrap();
        assert_eq!(entries.first().unwrap().log_id.index, 3);
    }
}
