//! The raft storage backend.
//!
//! Owns the raft engine, state machine, log store, snapshot store, and
//! transport, and exposes the physical storage contract plus cluster
//! management. The backend is constructed sealed: reads work against the
//! local state machine, mutations are rejected until [`unseal`] stands the
//! raft engine up. Sealing tears everything down again.
//!
//! [`unseal`]: RaftBackend::unseal

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bastion_cluster::ClusterListener;
use bastion_cluster::RaftStreamLayer;
use bastion_cluster::SharedKeyring;
use bastion_cluster::RAFT_STORAGE_ALPN;
use bastion_core::Backend;
use bastion_core::BackendError;
use bastion_core::EncryptorHook;
use bastion_core::Entry;
use bastion_core::HaBackend;
use bastion_core::HaLock;
use bastion_core::Operation;
use bastion_core::TxnEntry;
use openraft::error::ClientWriteError;
use openraft::error::InitializeError;
use openraft::error::RaftError;
use openraft::ChangeMembers;
use openraft::Config as RaftConfig;
use openraft::Raft;
use openraft::ServerState;
use openraft::SnapshotPolicy;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::autopilot::Autopilot;
use crate::autopilot::AutopilotConfig;
use crate::autopilot::AutopilotMetricHooks;
use crate::autopilot::AutopilotOptions;
use crate::autopilot::AutopilotState;
use crate::config::RaftBackendConfig;
use crate::follower::FollowerStates;
use crate::fsm::Fsm;
use crate::fsm::FsmStateMachine;
use crate::fsm::SUFFRAGE_NON_VOTER_NAME;
use crate::fsm::SUFFRAGE_VOTER_NAME;
use crate::lock::RaftLock;
use crate::log_cache::CachedLogStore;
use crate::log_store::LogStore;
use crate::log_store::RedbLogStore;
use crate::network::FollowerContacts;
use crate::network::StreamNetworkFactory;
use crate::rpc;
use crate::rpc::JoinRequest;
use crate::rpc::JoinResponse;
use crate::snapshot::SnapshotDocument;
use crate::snapshot::SnapshotStore;
use crate::types::raft_node_id;
use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;
use crate::verifier::LogVerifier;
use crate::wal::WalLogStore;
use crate::wire::LogData;
use crate::wire::LogOperation;
use crate::wire::OP_PUT;
use crate::wire::OP_RESTORE_CALLBACK;
use crate::wire::OP_VERIFIER_CHECKPOINT;

const NODE_ID_FILENAME: &str = "node-id";
const RAFT_STATE_DIR: &str = "raft";
const RAFT_DB_FILENAME: &str = "raft.db";
const WAL_DIRNAME: &str = "wal";
const SNAPSHOTS_DIRNAME: &str = "snapshots";

const RETRY_JOIN_INTERVAL: Duration = Duration::from_secs(2);
const JOIN_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Replicated storage path of the cluster transport keyring. Replicating the
/// keyring is what admits members that join after a rotation.
pub const TLS_KEYRING_PATH: &str = "core/cluster/tls-keyring";

/// A cluster member as reported by the admin interface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
    /// `voter` or `non-voter`.
    pub suffrage: String,
}

/// Everything `unseal` needs beyond the parsed configuration.
pub struct SetupOptions {
    /// Seal envelope for administrative snapshot payloads.
    pub sealer: Arc<dyn EncryptorHook>,
    /// The shared cluster listener the raft transport registers with.
    pub listener: Arc<ClusterListener>,
    /// Replicated transport keyring.
    pub keyring: SharedKeyring,
    /// Address peers dial for raft traffic; must be a specified IP.
    pub cluster_addr: SocketAddr,
    /// Gauges for autopilot health reporting.
    pub metric_hooks: AutopilotMetricHooks,
}

/// Live state that exists only while unsealed.
struct RaftCore {
    raft: Raft<TypeConfig>,
    log_store: CachedLogStore<LogStore>,
    stream_layer: Arc<RaftStreamLayer>,
    listener: Arc<ClusterListener>,
    snapshots: Arc<SnapshotStore>,
    autopilot: Option<Autopilot>,
    sealer: Arc<dyn EncryptorHook>,
    cluster_addr: SocketAddr,
    /// Cancels the RPC server, retry-join, and verifier tasks.
    tasks: CancellationToken,
}

/// Raft-replicated physical storage backend.
pub struct RaftBackend {
    config: RaftBackendConfig,
    node_id: String,
    data_dir: PathBuf,
    fsm: Arc<Fsm>,
    core: RwLock<Option<RaftCore>>,
    follower_states: Arc<FollowerStates>,
    contacts: Arc<FollowerContacts>,
    autopilot_config: Arc<SyncRwLock<AutopilotConfig>>,
    special_paths: SyncRwLock<Vec<String>>,
    fatal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    removed_callback: SyncRwLock<Option<Box<dyn Fn() + Send + Sync>>>,
    weak_self: Weak<RaftBackend>,
}

impl std::fmt::Debug for RaftBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftBackend")
            .field("config", &self.config)
            .field("node_id", &self.node_id)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl RaftBackend {
    /// Construct a sealed backend from a raw configuration map.
    pub fn new(conf: &std::collections::HashMap<String, String>) -> Result<Arc<Self>, BackendError> {
        let config = RaftBackendConfig::parse(conf).map_err(|e| BackendError::InvalidConfiguration {
            message: e.to_string(),
        })?;
        let data_dir = PathBuf::from(&config.path);
        std::fs::create_dir_all(&data_dir)?;

        let node_id = resolve_node_id(&data_dir, config.node_id.as_deref())?;
        let fsm = Arc::new(Fsm::open(&data_dir, config.initial_cache_size)?);
        if let Some(delay) = config.apply_delay {
            fsm.set_apply_delay(Some(delay));
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        fsm.set_fatal_tx(fatal_tx);

        info!(node_id = %node_id, path = %data_dir.display(), "created raft backend");
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            node_id,
            data_dir,
            fsm,
            core: RwLock::new(None),
            follower_states: Arc::new(FollowerStates::new()),
            contacts: Arc::new(FollowerContacts::new()),
            autopilot_config: Arc::new(SyncRwLock::new(AutopilotConfig::default())),
            special_paths: SyncRwLock::new(Vec::new()),
            fatal_rx: parking_lot::Mutex::new(Some(fatal_rx)),
            removed_callback: SyncRwLock::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    /// Durable string identifier of this node.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn follower_states(&self) -> &Arc<FollowerStates> {
        &self.follower_states
    }

    /// Receiver of fatal state-machine errors. The process owner must treat
    /// a received message as an abort signal: replicated state can no longer
    /// be trusted locally.
    pub fn take_fatal_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.fatal_rx.lock().take()
    }

    /// Mark `path` as mount-table-like so the larger per-table entry size
    /// limit applies. A trailing `/` registers a prefix.
    pub fn register_special_path(&self, path: impl Into<String>) {
        self.special_paths.write().push(path.into());
    }

    pub fn set_removed_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.removed_callback.write() = Some(callback);
    }

    fn is_special_path(&self, key: &str) -> bool {
        let paths = self.special_paths.read();
        paths.iter().any(|p| {
            if let Some(prefix) = p.strip_suffix('/') {
                key == prefix || key.starts_with(p.as_str())
            } else {
                key == p
            }
        })
    }

    /// Stand the raft engine up: open stores, build the transport, start
    /// background control loops. Bootstraps a single-node configuration when
    /// no prior raft state exists and no join targets are configured.
    pub async fn unseal(&self, options: SetupOptions) -> Result<(), BackendError> {
        let mut guard = self.core.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let raft_dir = self.data_dir.join(RAFT_STATE_DIR);
        std::fs::create_dir_all(&raft_dir)?;

        let log_store = self.open_log_store(&raft_dir)?;
        let cached_store = CachedLogStore::new(log_store);
        let has_state = cached_store.inner().has_state()?;

        let snapshots = Arc::new(SnapshotStore::open(
            raft_dir.join(SNAPSHOTS_DIRNAME),
            Arc::clone(&self.fsm),
            self.config.snapshot_delay,
        )?);

        let stream_layer = Arc::new(
            RaftStreamLayer::new(options.cluster_addr, Arc::clone(&options.keyring))
                .map_err(|e| BackendError::InvalidConfiguration { message: e.to_string() })?,
        );

        let network = StreamNetworkFactory::new(Arc::clone(&stream_layer), Arc::clone(&self.contacts));
        let raft_config = self.raft_config()?;
        let state_machine = FsmStateMachine::new(Arc::clone(&self.fsm), Arc::clone(&snapshots));

        let raft = Raft::<TypeConfig>::new(
            raft_node_id(&self.node_id),
            Arc::new(raft_config),
            network,
            cached_store.clone(),
            state_machine,
        )
        .await
        .map_err(|e| BackendError::Backend {
            message: format!("failed to start raft engine: {e}"),
        })?;

        let handler: Arc<dyn bastion_cluster::ClusterHandler> = stream_layer.clone();
        if let Err(e) = options.listener.add_handler(RAFT_STORAGE_ALPN, handler) {
            let _ = raft.shutdown().await;
            return Err(BackendError::Backend { message: e.to_string() });
        }
        let client: Arc<dyn bastion_cluster::ClusterClient> = stream_layer.clone();
        options.listener.add_client(RAFT_STORAGE_ALPN, client);

        let suffrage = if self.config.retry_join_as_non_voter {
            SUFFRAGE_NON_VOTER_NAME
        } else {
            SUFFRAGE_VOTER_NAME
        };
        self.fsm.record_suffrage(suffrage)?;

        // A keyring rotated through a previous incarnation lives in
        // replicated storage; adopt it before peers start dialing.
        if let Some(entry) = self.fsm.get(TLS_KEYRING_PATH).await? {
            match bincode::deserialize::<bastion_cluster::TlsKeyring>(&entry.value) {
                Ok(stored) => *options.keyring.write() = stored,
                Err(err) => warn!(error = %err, "ignoring undecodable stored TLS keyring"),
            }
        }

        let tasks = CancellationToken::new();
        let _ = rpc::spawn_rpc_server(raft.clone(), Arc::clone(&stream_layer), tasks.clone());

        let fsm_has_state = self.fsm.latest_state().0.index > 0;
        if !has_state && !fsm_has_state {
            if self.config.retry_join.is_empty() {
                self.bootstrap_single(&raft, options.cluster_addr).await?;
            } else {
                self.spawn_retry_join(&stream_layer, options.cluster_addr, tasks.clone());
            }
        }

        if self.config.raft_log_verifier_enabled {
            self.spawn_verifier(&raft, cached_store.clone(), tasks.clone());
        }

        let autopilot = if self.config.autopilot_disable {
            info!("autopilot is disabled");
            None
        } else {
            Some(Autopilot::start(
                raft.clone(),
                Arc::clone(&self.fsm),
                Arc::clone(&self.follower_states),
                Arc::clone(&self.contacts),
                Arc::clone(&self.autopilot_config),
                AutopilotOptions {
                    update_interval: self.config.autopilot_update_interval,
                    reconcile_interval: self.config.autopilot_reconcile_interval,
                    local: RaftServer::new(&self.node_id, options.cluster_addr.to_string()),
                    upgrade_version: self
                        .config
                        .autopilot_upgrade_version
                        .as_ref()
                        .map(|v| v.to_string()),
                    redundancy_zone: self.config.autopilot_redundancy_zone.clone(),
                },
                options.metric_hooks,
            ))
        };

        *guard = Some(RaftCore {
            raft,
            log_store: cached_store,
            stream_layer,
            listener: options.listener,
            snapshots,
            autopilot,
            sealer: options.sealer,
            cluster_addr: options.cluster_addr,
            tasks,
        });
        info!(node_id = %self.node_id, "raft backend unsealed");
        Ok(())
    }

    /// Tear the raft engine down and release resources.
    pub async fn seal(&self) -> Result<(), BackendError> {
        let core = self.core.write().await.take();
        let Some(core) = core else {
            return Ok(());
        };

        core.tasks.cancel();
        if let Some(autopilot) = &core.autopilot {
            autopilot.stop().await;
        }
        core.listener.stop_handler(RAFT_STORAGE_ALPN);
        core.listener.remove_client(RAFT_STORAGE_ALPN);
        core.stream_layer.close();
        core.raft.shutdown().await.map_err(|e| BackendError::Backend {
            message: format!("raft shutdown failed: {e}"),
        })?;
        info!(node_id = %self.node_id, "raft backend sealed");
        Ok(())
    }

    fn open_log_store(&self, raft_dir: &Path) -> Result<LogStore, BackendError> {
        let db_path = raft_dir.join(RAFT_DB_FILENAME);
        let mut use_wal = self.config.raft_wal;
        if use_wal && db_path.exists() {
            warn!(
                path = %db_path.display(),
                "raft_wal is configured but an existing raft.db was found; raft_wal is ignored"
            );
            use_wal = false;
        }
        if use_wal {
            Ok(LogStore::Wal(WalLogStore::open(raft_dir.join(WAL_DIRNAME))?))
        } else {
            Ok(LogStore::Redb(RedbLogStore::open(db_path)?))
        }
    }

    fn raft_config(&self) -> Result<RaftConfig, BackendError> {
        let multiplier = self.config.performance_multiplier;
        let config = RaftConfig {
            cluster_name: "bastion".to_string(),
            heartbeat_interval: 150 * multiplier,
            election_timeout_min: 500 * multiplier,
            election_timeout_max: 1000 * multiplier,
            max_payload_entries: self.config.max_batch_entries as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(8192),
            max_in_snapshot_log_to_keep: self.config.trailing_logs,
            enable_tick: true,
            ..Default::default()
        };
        config.validate().map_err(|e| BackendError::InvalidConfiguration {
            message: e.to_string(),
        })
    }

    async fn bootstrap_single(
        &self,
        raft: &Raft<TypeConfig>,
        cluster_addr: SocketAddr,
    ) -> Result<(), BackendError> {
        let server = RaftServer::new(&self.node_id, cluster_addr.to_string());
        info!(server = %server, "bootstrapping single-node cluster");
        let mut members = BTreeMap::new();
        members.insert(raft_node_id(&self.node_id), server);
        match raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
            Err(e) => Err(BackendError::Backend {
                message: format!("raft bootstrap failed: {e}"),
            }),
        }
    }

    /// Initialize a multi-node cluster from a seed membership.
    pub async fn bootstrap(&self, servers: Vec<RaftServer>) -> Result<(), BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        let members: BTreeMap<NodeId, RaftServer> = servers
            .into_iter()
            .map(|server| (raft_node_id(&server.id), server))
            .collect();
        core.raft.initialize(members).await.map_err(|e| BackendError::Backend {
            message: format!("raft bootstrap failed: {e}"),
        })
    }

    fn spawn_retry_join(
        &self,
        stream_layer: &Arc<RaftStreamLayer>,
        cluster_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let layer = Arc::clone(stream_layer);
        let targets = self.config.retry_join.clone();
        let request = JoinRequest {
            server: RaftServer::new(&self.node_id, cluster_addr.to_string()),
            non_voter: self.config.retry_join_as_non_voter,
        };
        tokio::spawn(async move {
            info!(targets = ?targets, "starting retry join");
            loop {
                let mut candidates: Vec<SocketAddr> = targets.clone();
                while let Some(addr) = candidates.pop() {
                    match rpc::send_join(&layer, addr, &request, JOIN_RPC_TIMEOUT).await {
                        Ok(JoinResponse::Accepted) => {
                            info!(leader = %addr, "joined raft cluster");
                            return;
                        }
                        Ok(JoinResponse::NotLeader { leader }) => {
                            if let Some(leader) = leader {
                                if let Ok(leader_addr) = leader.address.parse::<SocketAddr>() {
                                    candidates.push(leader_addr);
                                }
                            }
                        }
                        Err(err) => {
                            warn!(target = %addr, error = %err, "join attempt failed");
                        }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_JOIN_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    fn spawn_verifier(
        &self,
        raft: &Raft<TypeConfig>,
        log_store: CachedLogStore<LogStore>,
        shutdown: CancellationToken,
    ) {
        let interval = self.config.raft_log_verification_interval;
        let raft = raft.clone();
        let backend = self.weak_self.clone();
        tokio::spawn(async move {
            let mut verifier = LogVerifier::new(log_store);
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                if let Err(err) = verifier.run_once().await {
                    warn!(error = %err, "log verification pass failed");
                }
                // The leader replicates a checkpoint marker so every member
                // sees verifier traffic in its log.
                if raft.metrics().borrow().state == ServerState::Leader {
                    if let Some(backend) = backend.upgrade() {
                        let checkpoint = LogData::single(LogOperation {
                            op_type: OP_VERIFIER_CHECKPOINT,
                            key: String::new(),
                            value: Vec::new(),
                        });
                        if let Err(err) = backend.apply_log(checkpoint).await {
                            warn!(error = %err, "failed to replicate verifier checkpoint");
                        }
                    }
                }
            }
        });
    }

    /// Replicate one `LogData` command and wait for the local apply.
    pub(crate) async fn apply_log(&self, data: LogData) -> Result<crate::types::ApplyResult, BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;

        let limit = self.validate_log_data(&data)?;
        let bytes = data.encode_bytes();
        if bytes.len() as u64 > limit {
            return Err(BackendError::ValueTooLarge {
                got: bytes.len() as u64,
                max: limit,
            });
        }

        match core.raft.client_write(bytes).await {
            Ok(response) => {
                let result = response.data;
                if !result.success {
                    return Err(BackendError::ApplyFailed);
                }
                Ok(result)
            }
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                Err(BackendError::NotLeader {
                    leader: forward.leader_node.map(|node| node.address),
                })
            }
            Err(RaftError::APIError(other)) => Err(BackendError::Backend {
                message: other.to_string(),
            }),
            Err(RaftError::Fatal(fatal)) => {
                error!(error = %fatal, "raft engine entered fatal state during apply");
                Err(BackendError::ApplyFailed)
            }
        }
    }

    /// Validate per-entry sizes; returns the largest applicable limit for
    /// the whole command.
    fn validate_log_data(&self, data: &LogData) -> Result<u64, BackendError> {
        let mut largest = self.config.max_entry_size;
        for op in &data.operations {
            if op.op_type != OP_PUT {
                continue;
            }
            let limit = self.config.entry_size_limit_for(self.is_special_path(&op.key));
            largest = largest.max(limit);
            let size = (op.key.len() + op.value.len()) as u64;
            if size > limit {
                return Err(BackendError::ValueTooLarge { got: size, max: limit });
            }
        }
        Ok(largest)
    }

    /// Caps enforced on one transaction: entry count and total bytes.
    pub fn transaction_limits(&self) -> (usize, u64) {
        (self.config.max_batch_entries, self.config.max_batch_size)
    }

    // Cluster introspection

    pub async fn is_sealed(&self) -> bool {
        self.core.read().await.is_none()
    }

    /// True once this node observes itself as raft leader.
    pub async fn is_leader(&self) -> bool {
        let guard = self.core.read().await;
        match guard.as_ref() {
            Some(core) => core.raft.metrics().borrow().state == ServerState::Leader,
            None => false,
        }
    }

    /// Cluster address of the current leader, when known.
    pub async fn leader_address(&self) -> Option<String> {
        let guard = self.core.read().await;
        let core = guard.as_ref()?;
        let metrics = core.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader_id)
            .map(|node| node.address.clone())
    }

    /// Index of the last entry applied to the local state machine.
    pub fn applied_index(&self) -> u64 {
        self.fsm.latest_state().0.index
    }

    /// Last committed index known to the local log store.
    pub async fn committed_index(&self) -> u64 {
        let guard = self.core.read().await;
        let Some(core) = guard.as_ref() else {
            return 0;
        };
        let mut store = core.log_store.clone();
        use openraft::storage::RaftLogStorage;
        store
            .read_committed()
            .await
            .ok()
            .flatten()
            .map(|log_id| log_id.index)
            .unwrap_or(0)
    }

    pub async fn term(&self) -> u64 {
        let guard = self.core.read().await;
        match guard.as_ref() {
            Some(core) => core.raft.metrics().borrow().current_term,
            None => self.fsm.latest_state().0.term,
        }
    }

    /// Wait until the local applied index reaches `index`.
    pub async fn wait_for_applied_index(&self, index: u64, timeout: Duration) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.applied_index() >= index {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::Backend {
                    message: format!(
                        "timed out waiting for applied index {index}; at {}",
                        self.applied_index()
                    ),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // Peer management

    /// Add a voting member. The server joins as a learner first; with
    /// autopilot running, promotion happens after stabilization, otherwise
    /// immediately.
    pub async fn add_peer(&self, id: &str, address: &str) -> Result<(), BackendError> {
        self.admit_peer(id, address, false).await
    }

    /// Add a non-voting member.
    pub async fn add_nonvoting_peer(&self, id: &str, address: &str) -> Result<(), BackendError> {
        self.admit_peer(id, address, true).await
    }

    async fn admit_peer(&self, id: &str, address: &str, non_voter: bool) -> Result<(), BackendError> {
        // Record intent first so a promoter elected later still honors it.
        let suffrage = if non_voter { SUFFRAGE_NON_VOTER_NAME } else { SUFFRAGE_VOTER_NAME };
        self.apply_log(LogData::single(LogOperation::put(
            format!("{}{id}", rpc::DESIRED_SUFFRAGE_PREFIX),
            suffrage.as_bytes().to_vec(),
        )))
        .await?;

        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        let server = RaftServer::new(id, address);
        let node_id = raft_node_id(id);
        info!(server = %server, non_voter, "adding peer");

        core.raft
            .add_learner(node_id, server, true)
            .await
            .map_err(map_write_err)?;

        if !non_voter && core.autopilot.is_none() {
            let mut voters = std::collections::BTreeSet::new();
            voters.insert(node_id);
            core.raft
                .change_membership(ChangeMembers::AddVoterIds(voters), false)
                .await
                .map_err(map_write_err)?;
        }
        Ok(())
    }

    /// Remove a member from the configuration.
    pub async fn remove_peer(&self, id: &str) -> Result<(), BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        let node_id = raft_node_id(id);

        let metrics = core.raft.metrics().borrow().clone();
        let is_voter = metrics.membership_config.membership().voter_ids().any(|v| v == node_id);
        info!(peer = %id, is_voter, "removing peer");

        let mut set = std::collections::BTreeSet::new();
        set.insert(node_id);
        let change = if is_voter {
            ChangeMembers::RemoveVoters(set)
        } else {
            ChangeMembers::RemoveNodes(set)
        };
        core.raft.change_membership(change, false).await.map_err(map_write_err)?;
        self.follower_states.delete(id);

        if id == self.node_id {
            self.mark_removed(core)?;
        }
        Ok(())
    }

    fn mark_removed(&self, core: &RaftCore) -> Result<(), BackendError> {
        core.log_store.inner().set_removed(true)?;
        if let Some(callback) = self.removed_callback.read().as_ref() {
            callback();
        }
        Ok(())
    }

    /// Whether this node has been removed from its cluster.
    pub async fn is_removed(&self) -> bool {
        let guard = self.core.read().await;
        guard.as_ref().map(|core| core.log_store.inner().is_removed()).unwrap_or(false)
    }

    /// The committed membership as a peer list.
    pub async fn peers(&self) -> Result<Vec<Peer>, BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        let metrics = core.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();
        let voters: std::collections::HashSet<NodeId> = membership.voter_ids().collect();

        let mut peers: Vec<Peer> = membership
            .nodes()
            .map(|(node_id, node)| Peer {
                id: node.id.clone(),
                address: node.address.clone(),
                suffrage: if voters.contains(node_id) {
                    SUFFRAGE_VOTER_NAME.to_string()
                } else {
                    SUFFRAGE_NON_VOTER_NAME.to_string()
                },
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    // Autopilot surface

    pub async fn get_autopilot_server_state(&self) -> Result<Option<AutopilotState>, BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        Ok(core.autopilot.as_ref().and_then(|a| a.state()))
    }

    pub fn autopilot_config(&self) -> AutopilotConfig {
        self.autopilot_config.read().clone()
    }

    pub fn set_autopilot_config(&self, config: AutopilotConfig) {
        info!(?config, "updated autopilot configuration");
        *self.autopilot_config.write() = config;
    }

    /// Rotate the cluster transport keyring.
    ///
    /// The new keyring commits through raft first so that joiners admitted
    /// after the rotation can still validate peers; only then does the local
    /// transport swap its active key. Returns the new key's id.
    pub async fn rotate_keyring(&self) -> Result<String, BackendError> {
        let keyring_handle = {
            let guard = self.core.read().await;
            let core = guard.as_ref().ok_or(BackendError::Sealed)?;
            Arc::clone(core.stream_layer.keyring())
        };

        let mut next = keyring_handle.read().clone();
        let key_id = next.rotate().map_err(|e| BackendError::Backend {
            message: format!("keyring rotation failed: {e}"),
        })?;
        let bytes = bincode::serialize(&next).map_err(|e| BackendError::Backend {
            message: format!("failed to serialize keyring: {e}"),
        })?;

        self.apply_log(LogData::single(LogOperation::put(TLS_KEYRING_PATH, bytes)))
            .await?;
        *keyring_handle.write() = next;
        info!(key_id = %key_id, "rotated cluster TLS keyring");
        Ok(key_id)
    }

    /// Record this node's suffrage intent.
    pub fn set_desired_suffrage(&self, non_voter: bool) -> Result<(), BackendError> {
        let suffrage = if non_voter { SUFFRAGE_NON_VOTER_NAME } else { SUFFRAGE_VOTER_NAME };
        self.fsm.record_suffrage(suffrage)
    }

    // Administrative snapshots

    /// Ask the engine to take a snapshot now.
    pub async fn trigger_snapshot(&self) -> Result<(), BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        core.raft.trigger().snapshot().await.map_err(|e| BackendError::Backend {
            message: format!("snapshot trigger failed: {e}"),
        })
    }

    /// Available snapshots as reported by the snapshot store.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotDocument>, BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        Ok(core.snapshots.list()?)
    }

    /// Stream a sealed snapshot of the state machine to `writer`.
    pub async fn snapshot_to<W: std::io::Write>(&self, writer: &mut W) -> Result<(), BackendError> {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;

        let payload = self.fsm.snapshot_payload()?;
        let payload_bytes = bincode::serialize(&payload).map_err(|e| BackendError::Backend {
            message: format!("failed to serialize snapshot: {e}"),
        })?;
        let sealed = core.sealer.seal(&payload_bytes)?;

        let document = SnapshotDocument {
            version: crate::snapshot::SNAPSHOT_VERSION,
            meta: openraft::SnapshotMeta {
                last_log_id: payload.last_log_id,
                last_membership: payload.membership.clone(),
                snapshot_id: crate::snapshot::FSM_SNAPSHOT_ID.to_string(),
            },
            size: sealed.len() as u64,
        };
        bincode::serialize_into(writer, &(document, sealed)).map_err(|e| BackendError::Backend {
            message: format!("failed to write snapshot: {e}"),
        })
    }

    /// Install a sealed snapshot previously produced by [`snapshot_to`].
    ///
    /// [`snapshot_to`]: RaftBackend::snapshot_to
    pub async fn restore_snapshot<R: std::io::Read>(&self, reader: &mut R) -> Result<(), BackendError> {
        let sealer = {
            let guard = self.core.read().await;
            let core = guard.as_ref().ok_or(BackendError::Sealed)?;
            Arc::clone(&core.sealer)
        };

        let (document, sealed): (SnapshotDocument, Vec<u8>) =
            bincode::deserialize_from(reader).map_err(|e| BackendError::Backend {
                message: format!("failed to read snapshot: {e}"),
            })?;
        if document.version != crate::snapshot::SNAPSHOT_VERSION {
            return Err(BackendError::Backend {
                message: format!("unsupported snapshot version {}", document.version),
            });
        }
        let opened = sealer.open(&sealed)?;
        let payload: crate::fsm::SnapshotPayload =
            bincode::deserialize(&opened).map_err(|e| BackendError::Backend {
                message: format!("failed to decode snapshot payload: {e}"),
            })?;
        self.fsm.restore_from_payload(&payload)?;
        info!(
            snapshot_id = %document.meta.snapshot_id,
            index = document.meta.last_log_id.map(|l| l.index).unwrap_or(0),
            "restored administrative snapshot"
        );

        // Best-effort: let peers run their restore callbacks.
        let marker = LogData::single(LogOperation {
            op_type: OP_RESTORE_CALLBACK,
            key: String::new(),
            value: Vec::new(),
        });
        if let Err(err) = self.apply_log(marker).await {
            warn!(error = %err, "failed to replicate restore marker");
        }
        Ok(())
    }

    /// The stream layer's advertised address, when unsealed.
    pub async fn cluster_addr(&self) -> Option<SocketAddr> {
        let guard = self.core.read().await;
        guard.as_ref().map(|core| core.cluster_addr)
    }

    pub(crate) async fn leader_watch(
        &self,
    ) -> Result<tokio::sync::watch::Receiver<openraft::RaftMetrics<NodeId, RaftServer>>, BackendError>
    {
        let guard = self.core.read().await;
        let core = guard.as_ref().ok_or(BackendError::Sealed)?;
        Ok(core.raft.metrics())
    }
}

/// Register the raft backend constructor under the `raft` name.
///
/// The returned backend is sealed; the node layer unseals it once the
/// cluster listener and keyring exist.
pub fn register_backend(registry: &mut bastion_core::BackendRegistry) {
    registry.register("raft", |conf| {
        RaftBackend::new(conf).map(|backend| backend as Arc<dyn Backend>)
    });
}

fn map_write_err(
    err: RaftError<NodeId, ClientWriteError<NodeId, RaftServer>>,
) -> BackendError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => BackendError::NotLeader {
            leader: forward.leader_node.map(|node| node.address),
        },
        other => BackendError::Backend {
            message: other.to_string(),
        },
    }
}

/// Resolve the durable node id: explicit configuration wins, then the
/// `node-id` file, then a freshly generated UUID persisted with owner-only
/// permissions.
fn resolve_node_id(dir: &Path, configured: Option<&str>) -> Result<String, BackendError> {
    if let Some(id) = configured {
        return Ok(id.to_string());
    }
    let path = dir.join(NODE_ID_FILENAME);
    if path.exists() {
        let id = std::fs::read_to_string(&path)?;
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(id)
}

#[async_trait]
impl Backend for RaftBackend {
    async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError> {
        self.fsm.get(key).await
    }

    async fn put(&self, entry: Entry) -> Result<(), BackendError> {
        self.apply_log(LogData::single(LogOperation::put(entry.key, entry.value)))
            .await
            .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.apply_log(LogData::single(LogOperation::delete(key))).await.map(|_| ())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.fsm.list(prefix).await
    }

    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<(), BackendError> {
        let (max_entries, max_bytes) = self.transaction_limits();
        if txns.len() > max_entries {
            return Err(BackendError::Backend {
                message: format!(
                    "transaction of {} operations exceeds the maximum of {max_entries}",
                    txns.len()
                ),
            });
        }
        let total: u64 = txns
            .iter()
            .map(|t| (t.entry.key.len() + t.entry.value.len()) as u64)
            .sum();
        if total > max_bytes {
            return Err(BackendError::ValueTooLarge {
                got: total,
                max: max_bytes,
            });
        }

        let operations = txns
            .into_iter()
            .map(|txn| match txn.operation {
                Operation::Put => LogOperation::put(txn.entry.key, txn.entry.value),
                Operation::Delete => LogOperation::delete(txn.entry.key),
            })
            .collect();
        self.apply_log(LogData { operations }).await.map(|_| ())
    }
}

impl HaBackend for RaftBackend {
    fn ha_enabled(&self) -> bool {
        true
    }

    fn lock_with(&self, key: String, value: Vec<u8>) -> Result<Box<dyn HaLock>, BackendError> {
        let backend = self.weak_self.upgrade().ok_or(BackendError::NotInitialized)?;
        Ok(Box::new(RaftLock::new(backend, key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_generated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let id = resolve_node_id(dir.path(), None).unwrap();
        assert!(!id.is_empty());

        let again = resolve_node_id(dir.path(), None).unwrap();
        assert_eq!(id, again);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(NODE_ID_FILENAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn configured_node_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        let id = resolve_node_id(dir.path(), Some("core-0")).unwrap();
        assert_eq!(id, "core-0");
        assert!(!dir.path().join(NODE_ID_FILENAME).exists());
    }

    #[tokio::test]
    async fn sealed_backend_rejects_writes_but_serves_reads() {
        let dir = tempfile::tempdir().unwrap();
        let conf: std::collections::HashMap<String, String> = [
            ("path".to_string(), dir.path().display().to_string()),
            ("node_id".to_string(), "core-0".to_string()),
        ]
        .into();
        let backend = RaftBackend::new(&conf).unwrap();

        assert!(backend.is_sealed().await);
        assert!(backend.get("any").await.unwrap().is_none());
        let err = backend.put(Entry::new("k", b"v".to_vec())).await.unwrap_err();
        assert!(matches!(err, BackendError::Sealed));
    }

    #[test]
    fn registry_constructs_a_raft_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = bastion_core::BackendRegistry::new();
        register_backend(&mut registry);

        let conf: std::collections::HashMap<String, String> = [
            ("path".to_string(), dir.path().display().to_string()),
            ("node_id".to_string(), "core-0".to_string()),
        ]
        .into();
        assert!(registry.construct("raft", &conf).is_ok());
    }

    #[test]
    fn special_paths_get_the_table_limit() {
        let dir = tempfile::tempdir().unwrap();
        let conf: std::collections::HashMap<String, String> = [
            ("path".to_string(), dir.path().display().to_string()),
            ("node_id".to_string(), "core-0".to_string()),
            (
                "max_mount_and_namespace_table_entry_size".to_string(),
                "2048".to_string(),
            ),
            ("max_entry_size".to_string(), "1024".to_string()),
        ]
        .into();
        let backend = RaftBackend::new(&conf).unwrap();
        backend.register_special_path("core/mounts");
        backend.register_special_path("core/namespaces/");

        // Regular path: limited to max_entry_size.
        let big = vec![0u8; 1500];
        let data = LogData::single(LogOperation::put("secret/big", big.clone()));
        assert!(matches!(
            backend.validate_log_data(&data),
            Err(BackendError::ValueTooLarge { .. })
        ));

        // Special paths accept up to the table limit.
        for key in ["core/mounts", "core/namespaces/ns1"] {
            let data = LogData::single(LogOperation::put(key, big.clone()));
            backend.validate_log_data(&data).unwrap();
        }
    }
}
