//! The replicated state machine.
//!
//! A deterministic reducer over the raft log. State lives in a single-file
//! redb database with three tables: `data` (the key/value entries), `config`
//! (the latest committed raft configuration and local node config), and
//! `latest` (the last applied index/term). All mutations of one apply batch
//! commit in a single write transaction; reads go straight to the database
//! without a raft round-trip.

use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bastion_core::list_push_name;
use bastion_core::BackendError;
use bastion_core::Entry as PhysicalEntry;
use bastion_core::Operation;
use bastion_core::TxnEntry;
use openraft::storage::RaftStateMachine;
use openraft::storage::Snapshot;
use openraft::EntryPayload;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::StoredMembership;
use parking_lot::Mutex;
use parking_lot::RwLock;
use prost::Message;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::error;
use tracing::info;

use crate::snapshot::SnapshotBuilder;
use crate::snapshot::SnapshotStore;
use crate::types::ApplyResult;
use crate::types::FsmEntry;
use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;
use crate::wire::ConfigurationValue;
use crate::wire::ConfiguredServer;
use crate::wire::IndexValue;
use crate::wire::LogData;
use crate::wire::OP_DELETE;
use crate::wire::OP_GET;
use crate::wire::OP_PUT;
use crate::wire::OP_RESTORE_CALLBACK;
use crate::wire::OP_VERIFIER_CHECKPOINT;
use crate::wire::SUFFRAGE_NON_VOTER;
use crate::wire::SUFFRAGE_VOTER;

/// File name of the state machine database under the data directory.
pub const DATABASE_FILENAME: &str = "bastion.db";

const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
const CONFIG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config");
const LATEST_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("latest");

const LATEST_INDEX_KEY: &str = "index";
const APPLIED_LOG_ID_KEY: &str = "applied_log_id";
const MEMBERSHIP_KEY: &str = "membership";
const LATEST_CONFIG_KEY: &str = "latest_config";
const LOCAL_NODE_CONFIG_KEY: &str = "local_node_config";

pub const SUFFRAGE_VOTER_NAME: &str = "voter";
pub const SUFFRAGE_NON_VOTER_NAME: &str = "non-voter";

type SmResult<T> = Result<T, StorageError<NodeId>>;

fn sm_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::read_state_machine(&e).into()
}

fn sm_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::write_state_machine(&e).into()
}

fn io_err(e: impl std::error::Error + Send + Sync + 'static) -> BackendError {
    BackendError::Io {
        source: std::io::Error::other(e),
    }
}

/// Node-local configuration recorded in the `config` table. Written directly,
/// never through the log: it describes this node, not replicated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalNodeConfig {
    desired_suffrage: String,
}

/// A serialized, self-contained copy of the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub last_log_id: Option<LogId<NodeId>>,
    pub membership: StoredMembership<NodeId, RaftServer>,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The state machine.
pub struct Fsm {
    path: PathBuf,
    db: RwLock<Arc<Database>>,
    latest_term: AtomicU64,
    latest_index: AtomicU64,
    latest_config: Mutex<Option<ConfigurationValue>>,
    permits: Arc<Semaphore>,
    apply_delay: Mutex<Option<Duration>>,
    restore_cb: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    fatal_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Fsm {
    /// Open or create the database under `dir` and load the latest-state
    /// cache.
    pub fn open(dir: &Path, cache_size: Option<usize>) -> Result<Self, BackendError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DATABASE_FILENAME);

        let mut builder = Database::builder();
        if let Some(bytes) = cache_size {
            builder.set_cache_size(bytes);
        }
        let db = builder.create(&path).map_err(io_err)?;
        ensure_tables(&db).map_err(io_err)?;

        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let fsm = Self {
            path,
            db: RwLock::new(Arc::new(db)),
            latest_term: AtomicU64::new(0),
            latest_index: AtomicU64::new(0),
            latest_config: Mutex::new(None),
            permits: Arc::new(Semaphore::new(parallelism)),
            apply_delay: Mutex::new(None),
            restore_cb: Mutex::new(None),
            fatal_tx: Mutex::new(None),
        };
        fsm.load_latest()?;
        Ok(fsm)
    }

    fn db_handle(&self) -> Arc<Database> {
        Arc::clone(&self.db.read())
    }

    /// Install an artificial delay before each apply; test aid only.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock() = delay;
    }

    pub(crate) fn apply_delay(&self) -> Option<Duration> {
        *self.apply_delay.lock()
    }

    /// Register a callback run when a restore marker entry is applied.
    pub fn set_restore_callback(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        *self.restore_cb.lock() = Some(cb);
    }

    pub(crate) fn set_fatal_tx(&self, tx: mpsc::UnboundedSender<String>) {
        *self.fatal_tx.lock() = Some(tx);
    }

    fn report_fatal(&self, message: String) {
        error!(message = %message, "fatal state machine error");
        if let Some(tx) = self.fatal_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn load_latest(&self) -> Result<(), BackendError> {
        let db = self.db_handle();
        let txn = db.begin_read().map_err(io_err)?;
        let latest = txn.open_table(LATEST_TABLE).map_err(io_err)?;
        if let Some(raw) = latest.get(LATEST_INDEX_KEY).map_err(io_err)? {
            let value = IndexValue::decode(raw.value()).map_err(io_err)?;
            self.latest_term.store(value.term, Ordering::SeqCst);
            self.latest_index.store(value.index, Ordering::SeqCst);
        }
        let config = txn.open_table(CONFIG_TABLE).map_err(io_err)?;
        if let Some(raw) = config.get(LATEST_CONFIG_KEY).map_err(io_err)? {
            let value = ConfigurationValue::decode(raw.value()).map_err(io_err)?;
            *self.latest_config.lock() = Some(value);
        }
        Ok(())
    }

    /// The last applied `(index, term)` and the latest committed
    /// configuration observed by this state machine.
    pub fn latest_state(&self) -> (IndexValue, Option<ConfigurationValue>) {
        (
            IndexValue {
                term: self.latest_term.load(Ordering::SeqCst),
                index: self.latest_index.load(Ordering::SeqCst),
            },
            self.latest_config.lock().clone(),
        )
    }

    /// Read one entry. Not a raft round-trip.
    pub async fn get(&self, key: &str) -> Result<Option<PhysicalEntry>, BackendError> {
        let _permit = self.permits.acquire().await.map_err(|_| BackendError::NotInitialized)?;
        let db = self.db_handle();
        let txn = db.begin_read().map_err(io_err)?;
        let table = txn.open_table(DATA_TABLE).map_err(io_err)?;
        let value = table
            .get(key.as_bytes())
            .map_err(io_err)?
            .map(|guard| guard.value().to_vec());
        Ok(value.map(|value| PhysicalEntry::new(key, value)))
    }

    /// Ordered scan of names directly under `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let _permit = self.permits.acquire().await.map_err(|_| BackendError::NotInitialized)?;
        let db = self.db_handle();
        let txn = db.begin_read().map_err(io_err)?;
        let table = txn.open_table(DATA_TABLE).map_err(io_err)?;

        let mut names = Vec::new();
        for item in table.range(prefix.as_bytes()..).map_err(io_err)? {
            let (key, _) = item.map_err(io_err)?;
            let key = key.value();
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let stripped = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            list_push_name(&mut names, stripped);
        }
        Ok(names)
    }

    /// Write one entry directly, without replication. Restore paths and
    /// node-local bookkeeping only.
    pub async fn put(&self, entry: &PhysicalEntry) -> Result<(), BackendError> {
        let _permit = self.permits.acquire().await.map_err(|_| BackendError::NotInitialized)?;
        let db = self.db_handle();
        let txn = db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DATA_TABLE).map_err(io_err)?;
            table
                .insert(entry.key.as_bytes(), entry.value.as_slice())
                .map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    /// Delete one entry directly, without replication.
    pub async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let _permit = self.permits.acquire().await.map_err(|_| BackendError::NotInitialized)?;
        let db = self.db_handle();
        let txn = db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DATA_TABLE).map_err(io_err)?;
            table.remove(key.as_bytes()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    /// Apply a local transaction in one write transaction, without
    /// replication.
    pub async fn transaction(&self, txns: &[TxnEntry]) -> Result<(), BackendError> {
        let _permit = self.permits.acquire().await.map_err(|_| BackendError::NotInitialized)?;
        let db = self.db_handle();
        let txn = db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DATA_TABLE).map_err(io_err)?;
            for op in txns {
                match op.operation {
                    Operation::Put => {
                        table
                            .insert(op.entry.key.as_bytes(), op.entry.value.as_slice())
                            .map_err(io_err)?;
                    }
                    Operation::Delete => {
                        table.remove(op.entry.key.as_bytes()).map_err(io_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    /// Record this node's suffrage intent.
    pub fn record_suffrage(&self, desired_suffrage: &str) -> Result<(), BackendError> {
        let db = self.db_handle();
        let txn = db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(CONFIG_TABLE).map_err(io_err)?;
            let config = LocalNodeConfig {
                desired_suffrage: desired_suffrage.to_string(),
            };
            let bytes = bincode::serialize(&config).map_err(io_err)?;
            table.insert(LOCAL_NODE_CONFIG_KEY, bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    /// This node's recorded suffrage intent; `voter` when never recorded.
    pub fn desired_suffrage(&self) -> String {
        let read = || -> Result<Option<String>, BackendError> {
            let db = self.db_handle();
            let txn = db.begin_read().map_err(io_err)?;
            let table = txn.open_table(CONFIG_TABLE).map_err(io_err)?;
            match table.get(LOCAL_NODE_CONFIG_KEY).map_err(io_err)? {
                Some(raw) => {
                    let config: LocalNodeConfig =
                        bincode::deserialize(raw.value()).map_err(io_err)?;
                    Ok(Some(config.desired_suffrage))
                }
                None => Ok(None),
            }
        };
        read().ok().flatten().unwrap_or_else(|| SUFFRAGE_VOTER_NAME.to_string())
    }

    /// Fast-forward `latest` to cover a snapshot being created or installed.
    ///
    /// Rejects regressions: the witnessed `(term, index)` must not be below
    /// the current latest state.
    pub fn witness_snapshot(
        &self,
        index: u64,
        term: u64,
        configuration_index: u64,
        configuration: Option<ConfigurationValue>,
    ) -> Result<(), BackendError> {
        let current_term = self.latest_term.load(Ordering::SeqCst);
        let current_index = self.latest_index.load(Ordering::SeqCst);
        if (term, index) < (current_term, current_index) {
            return Err(BackendError::Backend {
                message: format!(
                    "refusing to witness snapshot at term {term} index {index}: \
                     behind latest term {current_term} index {current_index}"
                ),
            });
        }

        let db = self.db_handle();
        let txn = db.begin_write().map_err(io_err)?;
        {
            let mut latest = txn.open_table(LATEST_TABLE).map_err(io_err)?;
            let value = IndexValue { term, index };
            latest
                .insert(LATEST_INDEX_KEY, value.encode_to_vec().as_slice())
                .map_err(io_err)?;
        }
        if let Some(mut config) = configuration.clone() {
            config.index = configuration_index;
            let mut table = txn.open_table(CONFIG_TABLE).map_err(io_err)?;
            table
                .insert(LATEST_CONFIG_KEY, config.encode_to_vec().as_slice())
                .map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        self.latest_term.store(term, Ordering::SeqCst);
        self.latest_index.store(index, Ordering::SeqCst);
        if let Some(mut config) = configuration {
            config.index = configuration_index;
            *self.latest_config.lock() = Some(config);
        }
        Ok(())
    }

    /// Serialize the current state for a snapshot.
    pub fn snapshot_payload(&self) -> Result<SnapshotPayload, BackendError> {
        let db = self.db_handle();
        let txn = db.begin_read().map_err(io_err)?;

        let (last_log_id, membership) = self.read_applied_state(&txn).map_err(io_err)?;

        let table = txn.open_table(DATA_TABLE).map_err(io_err)?;
        let mut entries = Vec::new();
        for item in table.iter().map_err(io_err)? {
            let (key, value) = item.map_err(io_err)?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }

        Ok(SnapshotPayload {
            last_log_id,
            membership,
            entries,
        })
    }

    fn read_applied_state(
        &self,
        txn: &redb::ReadTransaction,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, RaftServer>), std::io::Error> {
        let latest = txn.open_table(LATEST_TABLE).map_err(std::io::Error::other)?;
        let last_log_id = match latest.get(APPLIED_LOG_ID_KEY).map_err(std::io::Error::other)? {
            Some(raw) => bincode::deserialize(raw.value()).map_err(std::io::Error::other)?,
            None => None,
        };
        let membership = match latest.get(MEMBERSHIP_KEY).map_err(std::io::Error::other)? {
            Some(raw) => bincode::deserialize(raw.value()).map_err(std::io::Error::other)?,
            None => StoredMembership::default(),
        };
        Ok((last_log_id, membership))
    }

    pub(crate) fn applied_state_blocking(
        &self,
    ) -> SmResult<(Option<LogId<NodeId>>, StoredMembership<NodeId, RaftServer>)> {
        let db = self.db_handle();
        let txn = db.begin_read().map_err(sm_read_err)?;
        self.read_applied_state(&txn).map_err(sm_read_err)
    }

    /// Atomically replace state with the payload's content.
    ///
    /// Writes a sibling database, fsyncs it, renames it over the live file,
    /// and reopens. Readers drain on the old handle; new operations see only
    /// the restored state.
    pub fn restore_from_payload(&self, payload: &SnapshotPayload) -> Result<(), BackendError> {
        let dir = self.path.parent().ok_or_else(|| BackendError::Backend {
            message: "database path has no parent directory".to_string(),
        })?;
        let tmp_path = dir.join(format!("{DATABASE_FILENAME}.restore"));
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        {
            let db = Database::create(&tmp_path).map_err(io_err)?;
            ensure_tables(&db).map_err(io_err)?;
            let txn = db.begin_write().map_err(io_err)?;
            {
                let mut data = txn.open_table(DATA_TABLE).map_err(io_err)?;
                for (key, value) in &payload.entries {
                    data.insert(key.as_slice(), value.as_slice()).map_err(io_err)?;
                }

                let mut latest = txn.open_table(LATEST_TABLE).map_err(io_err)?;
                let applied = bincode::serialize(&payload.last_log_id).map_err(io_err)?;
                latest.insert(APPLIED_LOG_ID_KEY, applied.as_slice()).map_err(io_err)?;
                let membership = bincode::serialize(&payload.membership).map_err(io_err)?;
                latest.insert(MEMBERSHIP_KEY, membership.as_slice()).map_err(io_err)?;

                let index_value = IndexValue {
                    term: payload.last_log_id.map(|id| id.leader_id.term).unwrap_or(0),
                    index: payload.last_log_id.map(|id| id.index).unwrap_or(0),
                };
                latest
                    .insert(LATEST_INDEX_KEY, index_value.encode_to_vec().as_slice())
                    .map_err(io_err)?;

                let config = configuration_from_membership(&payload.membership);
                let mut config_table = txn.open_table(CONFIG_TABLE).map_err(io_err)?;
                config_table
                    .insert(LATEST_CONFIG_KEY, config.encode_to_vec().as_slice())
                    .map_err(io_err)?;
            }
            txn.commit().map_err(io_err)?;
            // db drops here, closing the file before the rename
        }
        std::fs::File::open(dir)?.sync_all()?;

        {
            let mut guard = self.db.write();
            std::fs::rename(&tmp_path, &self.path)?;
            let db = Database::create(&self.path).map_err(io_err)?;
            *guard = Arc::new(db);
        }

        self.latest_term.store(
            payload.last_log_id.map(|id| id.leader_id.term).unwrap_or(0),
            Ordering::SeqCst,
        );
        self.latest_index
            .store(payload.last_log_id.map(|id| id.index).unwrap_or(0), Ordering::SeqCst);
        *self.latest_config.lock() = Some(configuration_from_membership(&payload.membership));

        info!(
            entries = payload.entries.len(),
            index = payload.last_log_id.map(|id| id.index).unwrap_or(0),
            "restored state machine from snapshot"
        );
        Ok(())
    }

    /// Apply a batch of committed entries in one write transaction.
    pub(crate) fn apply_batch(&self, entries: Vec<openraft::Entry<TypeConfig>>) -> SmResult<Vec<ApplyResult>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        // Decode everything up front so no transaction is held across a
        // corrupt-stream failure.
        enum Command {
            Blank,
            Ops(LogData),
            Membership(StoredMembership<NodeId, RaftServer>),
        }

        let mut commands = Vec::with_capacity(entries.len());
        let mut log_ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            log_ids.push(entry.log_id);
            let command = match &entry.payload {
                EntryPayload::Blank => Command::Blank,
                EntryPayload::Normal(bytes) => {
                    if bytes.is_empty() {
                        Command::Blank
                    } else {
                        match LogData::decode_bytes(bytes) {
                            Ok(data) => Command::Ops(data),
                            Err(e) => {
                                let message =
                                    format!("error decoding log data at index {}: {e}", entry.log_id.index);
                                self.report_fatal(message.clone());
                                return Err(sm_write_err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    message,
                                )));
                            }
                        }
                    }
                }
                EntryPayload::Membership(m) => {
                    Command::Membership(StoredMembership::new(Some(entry.log_id), m.clone()))
                }
            };
            commands.push(command);
        }

        let last_log_id = *log_ids.last().expect("non-empty batch");
        let current_index = self.latest_index.load(Ordering::SeqCst);
        let advance = last_log_id.index > current_index;

        let mut results = Vec::with_capacity(commands.len());
        let mut latest_membership: Option<StoredMembership<NodeId, RaftServer>> = None;
        let mut restore_requested = false;

        let db = self.db_handle();
        let txn = db.begin_write().map_err(|e| {
            self.report_fatal(format!("failed to begin apply transaction: {e}"));
            sm_write_err(e)
        })?;
        let apply_result = (|| -> Result<(), std::io::Error> {
            let mut data = txn.open_table(DATA_TABLE).map_err(std::io::Error::other)?;
            for command in &commands {
                let mut read_backs = Vec::new();
                match command {
                    Command::Blank => {}
                    Command::Ops(log_data) => {
                        for op in &log_data.operations {
                            match op.op_type {
                                OP_PUT => {
                                    data.insert(op.key.as_bytes(), op.value.as_slice())
                                        .map_err(std::io::Error::other)?;
                                }
                                OP_DELETE => {
                                    data.remove(op.key.as_bytes()).map_err(std::io::Error::other)?;
                                }
                                OP_GET => {
                                    let value = data
                                        .get(op.key.as_bytes())
                                        .map_err(std::io::Error::other)?
                                        .map(|guard| guard.value().to_vec())
                                        .unwrap_or_default();
                                    read_backs.push(FsmEntry {
                                        key: op.key.clone(),
                                        value,
                                    });
                                }
                                OP_RESTORE_CALLBACK => restore_requested = true,
                                OP_VERIFIER_CHECKPOINT => {}
                                other => {
                                    return Err(std::io::Error::new(
                                        std::io::ErrorKind::InvalidData,
                                        format!("{other} is not a supported transaction operation"),
                                    ));
                                }
                            }
                        }
                    }
                    Command::Membership(stored) => {
                        latest_membership = Some(stored.clone());
                    }
                }
                results.push(ApplyResult {
                    success: true,
                    entries: read_backs,
                });
            }

            let mut latest = txn.open_table(LATEST_TABLE).map_err(std::io::Error::other)?;
            let applied = bincode::serialize(&Some(last_log_id)).map_err(std::io::Error::other)?;
            latest
                .insert(APPLIED_LOG_ID_KEY, applied.as_slice())
                .map_err(std::io::Error::other)?;
            if advance {
                let value = IndexValue {
                    term: last_log_id.leader_id.term,
                    index: last_log_id.index,
                };
                latest
                    .insert(LATEST_INDEX_KEY, value.encode_to_vec().as_slice())
                    .map_err(std::io::Error::other)?;
            }
            if let Some(stored) = &latest_membership {
                let bytes = bincode::serialize(stored).map_err(std::io::Error::other)?;
                latest.insert(MEMBERSHIP_KEY, bytes.as_slice()).map_err(std::io::Error::other)?;

                let config = configuration_from_membership(stored);
                let mut config_table = txn.open_table(CONFIG_TABLE).map_err(std::io::Error::other)?;
                config_table
                    .insert(LATEST_CONFIG_KEY, config.encode_to_vec().as_slice())
                    .map_err(std::io::Error::other)?;
            }
            Ok(())
        })();

        if let Err(e) = apply_result {
            self.report_fatal(format!("failed to apply log batch: {e}"));
            return Err(sm_write_err(e));
        }
        if let Err(e) = txn.commit() {
            self.report_fatal(format!("failed to commit apply transaction: {e}"));
            return Err(sm_write_err(e));
        }

        if advance {
            self.latest_term.store(last_log_id.leader_id.term, Ordering::SeqCst);
            self.latest_index.store(last_log_id.index, Ordering::SeqCst);
        }
        if let Some(stored) = latest_membership {
            *self.latest_config.lock() = Some(configuration_from_membership(&stored));
        }
        if restore_requested {
            if let Some(cb) = self.restore_cb.lock().clone() {
                tokio::task::spawn_blocking(move || cb());
            }
        }

        Ok(results)
    }
}

fn ensure_tables(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        txn.open_table(DATA_TABLE)?;
        txn.open_table(CONFIG_TABLE)?;
        txn.open_table(LATEST_TABLE)?;
    }
    txn.commit()?;
    Ok(())
}

/// Project an openraft membership into the configuration record the state
/// machine persists.
pub(crate) fn configuration_from_membership(
    stored: &StoredMembership<NodeId, RaftServer>,
) -> ConfigurationValue {
    let voters: std::collections::HashSet<NodeId> = stored.membership().voter_ids().collect();
    let mut servers: Vec<ConfiguredServer> = stored
        .membership()
        .nodes()
        .map(|(node_id, node)| ConfiguredServer {
            suffrage: if voters.contains(node_id) {
                SUFFRAGE_VOTER
            } else {
                SUFFRAGE_NON_VOTER
            },
            id: node.id.clone(),
            address: node.address.clone(),
        })
        .collect();
    servers.sort_by(|a, b| a.id.cmp(&b.id));
    ConfigurationValue {
        index: stored.log_id().as_ref().map(|id| id.index).unwrap_or(0),
        servers,
    }
}

/// openraft state machine handle: the FSM plus the snapshot store.
#[derive(Clone)]
pub struct FsmStateMachine {
    pub(crate) fsm: Arc<Fsm>,
    pub(crate) snapshots: Arc<SnapshotStore>,
}

impl FsmStateMachine {
    pub fn new(fsm: Arc<Fsm>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { fsm, snapshots }
    }
}

impl RaftStateMachine<TypeConfig> for FsmStateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> SmResult<(Option<LogId<NodeId>>, StoredMembership<NodeId, RaftServer>)> {
        self.fsm.applied_state_blocking()
    }

    async fn apply<I>(&mut self, entries: I) -> SmResult<Vec<ApplyResult>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        if let Some(delay) = self.fsm.apply_delay() {
            tokio::time::sleep(delay).await;
        }
        self.fsm.apply_batch(entries)
    }

    async fn begin_receiving_snapshot(&mut self) -> SmResult<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, RaftServer>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> SmResult<()> {
        self.snapshots.install(meta, snapshot.into_inner()).await
    }

    async fn get_current_snapshot(&mut self) -> SmResult<Option<Snapshot<TypeConfig>>> {
        self.snapshots.current_snapshot()
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder::new(Arc::clone(&self.fsm), Arc::clone(&self.snapshots))
    }
}

/// Build a committed log id; test helper shared across the crate.
#[cfg(test)]
pub(crate) fn test_log_id(term: u64, index: u64) -> LogId<NodeId> {
    LogId::new(openraft::CommittedLeaderId::new(term, 0), index)
}

#[cfg(test)]
mod tests {
    use openraft::Entry;

    use super::*;
    use crate::wire::LogOperation;

    fn open_fsm(dir: &Path) -> Fsm {
        Fsm::open(dir, None).unwrap()
    }

    fn normal_entry(term: u64, index: u64, data: LogData) -> Entry<TypeConfig> {
        Entry {
            log_id: test_log_id(term, index),
            payload: EntryPayload::Normal(data.encode_bytes()),
        }
    }

    #[tokio::test]
    async fn apply_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let entry = normal_entry(1, 1, LogData::single(LogOperation::put("secret/foo", b"zork".to_vec())));
        let results = fsm.apply_batch(vec![entry]).unwrap();
        assert!(results[0].success);

        let read = fsm.get("secret/foo").await.unwrap().unwrap();
        assert_eq!(read.value, b"zork");
        assert_eq!(fsm.latest_state().0.index, 1);
    }

    #[tokio::test]
    async fn batch_apply_preserves_operation_order() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let data = LogData {
            operations: vec![
                LogOperation::put("a", b"1".to_vec()),
                LogOperation::put("a", b"2".to_vec()),
                LogOperation::delete("a"),
                LogOperation::put("a", b"3".to_vec()),
            ],
        };
        fsm.apply_batch(vec![normal_entry(1, 1, data)]).unwrap();
        assert_eq!(fsm.get("a").await.unwrap().unwrap().value, b"3");
    }

    #[tokio::test]
    async fn batched_apply_matches_sequential_apply() {
        let dir_batched = tempfile::tempdir().unwrap();
        let dir_sequential = tempfile::tempdir().unwrap();
        let batched = open_fsm(dir_batched.path());
        let sequential = open_fsm(dir_sequential.path());

        let entries: Vec<_> = (1..=5u64)
            .map(|i| {
                normal_entry(
                    1,
                    i,
                    LogData::single(LogOperation::put(format!("key-{i}"), format!("value-{i}").into_bytes())),
                )
            })
            .collect();

        batched.apply_batch(entries.clone()).unwrap();
        for entry in entries {
            sequential.apply_batch(vec![entry]).unwrap();
        }

        assert_eq!(
            batched.snapshot_payload().unwrap().entries,
            sequential.snapshot_payload().unwrap().entries
        );
        assert_eq!(batched.latest_state().0.index, sequential.latest_state().0.index);
    }

    #[tokio::test]
    async fn get_op_reads_back_current_value() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let data = LogData {
            operations: vec![
                LogOperation::put("k", b"v".to_vec()),
                LogOperation {
                    op_type: OP_GET,
                    key: "k".to_string(),
                    value: Vec::new(),
                },
            ],
        };
        let results = fsm.apply_batch(vec![normal_entry(1, 1, data)]).unwrap();
        assert_eq!(results[0].entries.len(), 1);
        assert_eq!(results[0].entries[0].value, b"v");
    }

    #[tokio::test]
    async fn unknown_op_type_fails_apply() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let data = LogData {
            operations: vec![LogOperation {
                op_type: 3, // not a defined operation
                key: "k".to_string(),
                value: Vec::new(),
            }],
        };
        assert!(fsm.apply_batch(vec![normal_entry(1, 1, data)]).is_err());
    }

    #[tokio::test]
    async fn list_computes_folders() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let data = LogData {
            operations: vec![
                LogOperation::put("secret/a", b"x".to_vec()),
                LogOperation::put("secret/sub/one", b"x".to_vec()),
                LogOperation::put("secret/sub/two", b"x".to_vec()),
                LogOperation::put("secret/z", b"x".to_vec()),
            ],
        };
        fsm.apply_batch(vec![normal_entry(1, 1, data)]).unwrap();

        assert_eq!(fsm.list("secret/").await.unwrap(), vec!["a", "sub/", "z"]);
        assert_eq!(fsm.list("secret/sub/").await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn latest_index_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        fsm.apply_batch(vec![normal_entry(
            1,
            5,
            LogData::single(LogOperation::put("k", b"v".to_vec())),
        )])
        .unwrap();
        assert_eq!(fsm.latest_state().0.index, 5);

        // A batch ending below the latest index must not regress it.
        fsm.apply_batch(vec![normal_entry(
            1,
            3,
            LogData::single(LogOperation::put("k2", b"v".to_vec())),
        )])
        .unwrap();
        assert_eq!(fsm.latest_state().0.index, 5);
    }

    #[tokio::test]
    async fn witness_snapshot_rejects_regression() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        fsm.witness_snapshot(10, 2, 0, None).unwrap();
        assert_eq!(fsm.latest_state().0.index, 10);
        assert!(fsm.witness_snapshot(5, 1, 0, None).is_err());
        assert_eq!(fsm.latest_state().0.index, 10);
    }

    #[tokio::test]
    async fn snapshot_restore_is_identity_on_data() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let entries: Vec<_> = (0..100u64)
            .map(|i| {
                normal_entry(
                    1,
                    i + 1,
                    LogData::single(LogOperation::put(format!("key-{i:03}"), format!("value-{i}").into_bytes())),
                )
            })
            .collect();
        fsm.apply_batch(entries).unwrap();

        let payload = fsm.snapshot_payload().unwrap();

        let fresh_dir = tempfile::tempdir().unwrap();
        let fresh = open_fsm(fresh_dir.path());
        fresh.restore_from_payload(&payload).unwrap();

        assert_eq!(fresh.snapshot_payload().unwrap().entries, payload.entries);
        assert_eq!(fresh.latest_state().0.index, 100);
        assert_eq!(fresh.get("key-050").await.unwrap().unwrap().value, b"value-50");
    }

    #[tokio::test]
    async fn restore_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fsm = open_fsm(dir.path());
            fsm.apply_batch(vec![normal_entry(
                1,
                1,
                LogData::single(LogOperation::put("durable", b"yes".to_vec())),
            )])
            .unwrap();
        }
        let reopened = open_fsm(dir.path());
        assert_eq!(reopened.get("durable").await.unwrap().unwrap().value, b"yes");
        assert_eq!(reopened.latest_state().0.index, 1);
    }

    #[tokio::test]
    async fn desired_suffrage_defaults_to_voter() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());
        assert_eq!(fsm.desired_suffrage(), "voter");
        fsm.record_suffrage("non-voter").unwrap();
        assert_eq!(fsm.desired_suffrage(), "non-voter");
    }
}
