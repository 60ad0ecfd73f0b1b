//! Autopilot: topology health tracking and reconciliation.
//!
//! A single task owns all mutable control state, consuming timer ticks: an
//! update tick (~2s) folds replication progress and observed peer contact
//! into [`FollowerStates`], a reconcile tick (~10s) evaluates promotions,
//! dead-server cleanup, and the cluster health summary, and a one-second
//! ticker flips followers to dead past the dead-server contact threshold.
//! All of it is leader-only; on leadership loss the follower map is cleared
//! wholesale.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use openraft::ChangeMembers;
use openraft::Raft;
use openraft::ServerState;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::follower::FollowerStates;
use crate::follower::FollowerUpdate;
use crate::fsm::Fsm;
use crate::fsm::SUFFRAGE_NON_VOTER_NAME;
use crate::network::FollowerContacts;
use crate::rpc::DESIRED_SUFFRAGE_PREFIX;
use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;

/// Default period of the stats-gathering tick.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(2);

/// Default period of the reconcile tick; must not be below the update
/// interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Health policy for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotConfig {
    /// Remove servers that autopilot has declared dead.
    pub cleanup_dead_servers: bool,
    /// A server without leader contact for this long is unhealthy.
    pub last_contact_threshold: Duration,
    /// A server without leader contact for this long is declared dead; only
    /// effective with `cleanup_dead_servers`.
    pub dead_server_last_contact_threshold: Duration,
    /// Log entries a server may trail the leader and stay healthy.
    pub max_trailing_logs: u64,
    /// Dead-server cleanup never reduces the voter count below this.
    pub min_quorum: usize,
    /// Continuous healthy time before a non-voter is promoted.
    pub server_stabilization_time: Duration,
    /// Skip version-aware promotion ordering.
    pub disable_upgrade_migration: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            cleanup_dead_servers: false,
            last_contact_threshold: Duration::from_secs(10),
            dead_server_last_contact_threshold: Duration::from_secs(24 * 60 * 60),
            max_trailing_logs: 1000,
            min_quorum: 3,
            server_stabilization_time: Duration::from_secs(10),
            disable_upgrade_migration: false,
        }
    }
}

/// Per-server view in the autopilot state report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotServerInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    /// `alive` or `left`.
    pub node_status: String,
    /// Seconds since last leader contact; absent for the leader itself.
    pub last_contact_secs: Option<f64>,
    pub last_term: u64,
    pub last_index: u64,
    pub healthy: bool,
    /// Unix seconds since which the server has been continuously healthy.
    pub stable_since: u64,
    /// `leader`, `voter`, or `non-voter`.
    pub status: String,
    pub upgrade_version: Option<String>,
    pub redundancy_zone: Option<String>,
    /// Placement tags (`upgrade_version`, `redundancy_zone`) for operators.
    pub meta: HashMap<String, String>,
}

/// Cluster health as reported over the admin interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotState {
    pub healthy: bool,
    pub failure_tolerance: usize,
    pub leader: String,
    pub voters: Vec<String>,
    pub non_voters: Vec<String>,
    pub servers: HashMap<String, AutopilotServerInfo>,
}

/// Gauge callbacks invoked on every reconcile pass.
#[derive(Default)]
pub struct AutopilotMetricHooks {
    pub failure_tolerance: Option<Box<dyn Fn(usize) + Send + Sync>>,
    pub healthy: Option<Box<dyn Fn(bool) + Send + Sync>>,
}

/// Static inputs of one autopilot instance.
pub struct AutopilotOptions {
    pub update_interval: Duration,
    pub reconcile_interval: Duration,
    pub local: RaftServer,
    pub upgrade_version: Option<String>,
    pub redundancy_zone: Option<String>,
}

/// Handle to the running autopilot task.
pub struct Autopilot {
    state_rx: watch::Receiver<Option<AutopilotState>>,
    config: Arc<RwLock<AutopilotConfig>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Autopilot {
    /// Start the control loop.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        raft: Raft<TypeConfig>,
        fsm: Arc<Fsm>,
        follower_states: Arc<FollowerStates>,
        contacts: Arc<FollowerContacts>,
        config: Arc<RwLock<AutopilotConfig>>,
        options: AutopilotOptions,
        hooks: AutopilotMetricHooks,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            raft,
            fsm,
            follower_states,
            contacts,
            config: Arc::clone(&config),
            options,
            hooks,
            state_tx,
            local_id: 0,
            was_leader: false,
            leader_since: None,
            stable_since: HashMap::new(),
        };
        let token = shutdown.clone();
        let task = tokio::spawn(worker.run(token));

        Self {
            state_rx,
            config,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Latest computed cluster state; `None` until the first reconcile pass
    /// on a leader.
    pub fn state(&self) -> Option<AutopilotState> {
        self.state_rx.borrow().clone()
    }

    pub fn config(&self) -> AutopilotConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: AutopilotConfig) {
        info!(?config, "updated autopilot configuration");
        *self.config.write() = config;
    }

    /// Stop the control loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Worker {
    raft: Raft<TypeConfig>,
    fsm: Arc<Fsm>,
    follower_states: Arc<FollowerStates>,
    contacts: Arc<FollowerContacts>,
    config: Arc<RwLock<AutopilotConfig>>,
    options: AutopilotOptions,
    hooks: AutopilotMetricHooks,
    state_tx: watch::Sender<Option<AutopilotState>>,
    local_id: NodeId,
    was_leader: bool,
    leader_since: Option<Instant>,
    stable_since: HashMap<String, (Instant, u64)>,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) {
        self.local_id = crate::types::raft_node_id(&self.options.local.id);

        let mut update_tick = tokio::time::interval(self.options.update_interval);
        let mut reconcile_tick = tokio::time::interval(self.options.reconcile_interval);
        let mut dead_tick = tokio::time::interval(Duration::from_secs(1));
        update_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        dead_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            update_interval = ?self.options.update_interval,
            reconcile_interval = ?self.options.reconcile_interval,
            "starting autopilot"
        );

        loop {
            tokio::select! {
                _ = update_tick.tick() => {
                    if self.leadership_gate() {
                        self.update_follower_stats().await;
                    }
                }
                _ = reconcile_tick.tick() => {
                    if self.leadership_gate() {
                        self.reconcile().await;
                    }
                }
                _ = dead_tick.tick() => {
                    if self.leadership_gate() {
                        self.check_dead_servers();
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("stopping autopilot");
                    return;
                }
            }
        }
    }

    /// Track leadership transitions; returns true while this node leads.
    fn leadership_gate(&mut self) -> bool {
        let is_leader = self.raft.metrics().borrow().state == ServerState::Leader;
        if is_leader && !self.was_leader {
            self.leader_since = Some(Instant::now());
        }
        if !is_leader && self.was_leader {
            // Follower telemetry belongs to the leader that observed it.
            self.follower_states.clear();
            self.contacts.clear();
            self.stable_since.clear();
            self.leader_since = None;
        }
        self.was_leader = is_leader;
        is_leader
    }

    async fn desired_suffrage_of(&self, server_id: &str) -> String {
        let key = format!("{DESIRED_SUFFRAGE_PREFIX}{server_id}");
        match self.fsm.get(&key).await {
            Ok(Some(entry)) => String::from_utf8_lossy(&entry.value).into_owned(),
            _ => crate::fsm::SUFFRAGE_VOTER_NAME.to_string(),
        }
    }

    /// Gather per-follower stats: applied index and term from replication
    /// metrics, contact from the network layer's observations.
    async fn update_follower_stats(&mut self) {
        let metrics = self.raft.metrics().borrow().clone();
        let Some(replication) = metrics.replication.clone() else {
            return;
        };

        let nodes: Vec<(NodeId, RaftServer)> = metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect();

        for (node_id, node) in nodes {
            if node_id == self.local_id {
                continue;
            }
            let Some(contact) = self.contacts.last_contact(&node.id) else {
                continue;
            };
            // Fold in only fresh observations; a stale timestamp means the
            // peer has not answered since the last update.
            let prior = self.follower_states.get(&node.id).and_then(|s| s.last_heartbeat);
            if prior.map(|p| contact <= p).unwrap_or(false) {
                continue;
            }

            let applied = replication
                .get(&node_id)
                .and_then(|log_id| log_id.as_ref().map(|l| l.index))
                .unwrap_or(0);
            let desired_suffrage = self.desired_suffrage_of(&node.id).await;
            self.follower_states.update(&FollowerUpdate {
                node_id: node.id.clone(),
                applied_index: applied,
                term: metrics.current_term,
                desired_suffrage,
                upgrade_version: None,
                redundancy_zone: None,
            });
        }
    }

    /// Flip followers to dead once they exceed the dead-server contact
    /// threshold.
    fn check_dead_servers(&self) {
        let config = self.config.read().clone();
        if !config.cleanup_dead_servers || config.dead_server_last_contact_threshold.is_zero() {
            return;
        }
        for id in self.follower_states.ids() {
            let Some(state) = self.follower_states.get(&id) else {
                continue;
            };
            if state.is_dead() {
                continue;
            }
            if let Some(heartbeat) = state.last_heartbeat {
                if heartbeat.elapsed() > config.dead_server_last_contact_threshold {
                    warn!(server = %id, "follower exceeded dead-server contact threshold");
                    self.follower_states.mark_dead(&id);
                }
            }
        }
    }

    async fn reconcile(&mut self) {
        let config = self.config.read().clone();
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.clone();
        let voter_ids: HashSet<NodeId> = membership.membership().voter_ids().collect();
        let nodes: Vec<(NodeId, RaftServer)> = membership
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect();

        let (leader_latest, _) = self.fsm.latest_state();
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut servers = HashMap::new();
        let mut voters = Vec::new();
        let mut non_voters = Vec::new();
        let mut healthy_voters = 0usize;
        let mut all_voters_healthy = true;
        let mut promotable: BTreeSet<NodeId> = BTreeSet::new();
        let mut dead: Vec<(NodeId, RaftServer, bool)> = Vec::new();

        for (node_id, node) in &nodes {
            let is_voter = voter_ids.contains(node_id);
            let is_local = *node_id == self.local_id;

            let (healthy, node_status, last_contact_secs, last_term, last_index) = if is_local {
                (true, "alive".to_string(), None, leader_latest.term, leader_latest.index)
            } else {
                match self.follower_states.get(&node.id) {
                    Some(state) => {
                        let contact = state.last_heartbeat.map(|hb| hb.elapsed());
                        let in_contact = contact
                            .map(|c| c <= config.last_contact_threshold)
                            .unwrap_or(false);
                        let caught_up = leader_latest
                            .index
                            .saturating_sub(state.applied_index)
                            <= config.max_trailing_logs;
                        let status = if state.is_dead() { "left" } else { "alive" };
                        (
                            in_contact && caught_up && !state.is_dead(),
                            status.to_string(),
                            contact.map(|c| c.as_secs_f64()),
                            state.last_term,
                            state.applied_index,
                        )
                    }
                    None => (false, "alive".to_string(), None, 0, 0),
                }
            };

            // Stabilization tracking: continuously healthy since when.
            let stable_since = if healthy {
                self.stable_since
                    .entry(node.id.clone())
                    .or_insert_with(|| (Instant::now(), now_unix))
                    .1
            } else {
                self.stable_since.remove(&node.id);
                0
            };

            if is_voter {
                voters.push(node.id.clone());
                if healthy {
                    healthy_voters += 1;
                } else {
                    all_voters_healthy = false;
                }
            } else {
                non_voters.push(node.id.clone());
            }

            if let Some(state) = self.follower_states.get(&node.id) {
                if state.is_dead() {
                    dead.push((*node_id, node.clone(), is_voter));
                }
            }

            if !is_voter && healthy {
                let stable_for = self
                    .stable_since
                    .get(&node.id)
                    .map(|(since, _)| since.elapsed())
                    .unwrap_or_default();
                let desired = self.desired_suffrage_of(&node.id).await;
                let leader_age = self.leader_since.map(|s| s.elapsed()).unwrap_or_default();
                // A freshly elected leader has not watched peers long enough
                // to judge stability; suppress promotion until it has.
                let leader_settled =
                    leader_age.as_secs_f64() >= config.server_stabilization_time.as_secs_f64() * 1.1;
                if desired != SUFFRAGE_NON_VOTER_NAME
                    && stable_for >= config.server_stabilization_time
                    && leader_settled
                {
                    promotable.insert(*node_id);
                }
            }

            let status = if is_local {
                "leader"
            } else if is_voter {
                "voter"
            } else {
                "non-voter"
            };
            let upgrade_version = if is_local { self.options.upgrade_version.clone() } else { None };
            let redundancy_zone = if is_local { self.options.redundancy_zone.clone() } else { None };
            let mut meta = HashMap::new();
            if let Some(version) = &upgrade_version {
                meta.insert("upgrade_version".to_string(), version.clone());
            }
            if let Some(zone) = &redundancy_zone {
                meta.insert("redundancy_zone".to_string(), zone.clone());
            }
            servers.insert(
                node.id.clone(),
                AutopilotServerInfo {
                    id: node.id.clone(),
                    name: node.id.clone(),
                    address: node.address.clone(),
                    node_status,
                    last_contact_secs,
                    last_term,
                    last_index,
                    healthy,
                    stable_since,
                    status: status.to_string(),
                    upgrade_version,
                    redundancy_zone,
                    meta,
                },
            );
        }

        if !promotable.is_empty() {
            info!(servers = ?promotable, "promoting stabilized servers to voters");
            // A rejected change (configuration moved underfoot) is retried on
            // the next reconcile tick.
            if let Err(err) = self
                .raft
                .change_membership(ChangeMembers::AddVoterIds(promotable), false)
                .await
            {
                warn!(error = %err, "voter promotion failed; will retry");
            }
        }

        if config.cleanup_dead_servers {
            self.cleanup_dead_servers(&config, &voter_ids, dead).await;
        }

        let quorum = voter_ids.len() / 2 + 1;
        let healthy = all_voters_healthy && !voters.is_empty();
        let failure_tolerance = healthy_voters.saturating_sub(quorum);

        if let Some(hook) = &self.hooks.failure_tolerance {
            hook(failure_tolerance);
        }
        if let Some(hook) = &self.hooks.healthy {
            hook(healthy);
        }

        let state = AutopilotState {
            healthy,
            failure_tolerance,
            leader: self.options.local.id.clone(),
            voters,
            non_voters,
            servers,
        };
        debug!(healthy = state.healthy, voters = state.voters.len(), "autopilot reconcile pass");
        let _ = self.state_tx.send(Some(state));
    }

    /// Remove dead servers, never dropping the voter count below quorum.
    async fn cleanup_dead_servers(
        &mut self,
        config: &AutopilotConfig,
        voter_ids: &HashSet<NodeId>,
        dead: Vec<(NodeId, RaftServer, bool)>,
    ) {
        let mut remaining_voters = voter_ids.len();
        for (node_id, node, is_voter) in dead {
            if is_voter {
                if remaining_voters.saturating_sub(1) < config.min_quorum {
                    warn!(
                        server = %node,
                        remaining = remaining_voters,
                        min_quorum = config.min_quorum,
                        "not removing dead server: would break quorum"
                    );
                    continue;
                }
                info!(server = %node, "removing dead voter from configuration");
                let mut set = BTreeSet::new();
                set.insert(node_id);
                if let Err(err) = self
                    .raft
                    .change_membership(ChangeMembers::RemoveVoters(set), false)
                    .await
                {
                    warn!(server = %node, error = %err, "dead server removal failed; will retry");
                    continue;
                }
                remaining_voters -= 1;
            } else {
                info!(server = %node, "removing dead non-voter from configuration");
                let mut set = BTreeSet::new();
                set.insert(node_id);
                if let Err(err) = self
                    .raft
                    .change_membership(ChangeMembers::RemoveNodes(set), false)
                    .await
                {
                    warn!(server = %node, error = %err, "dead server removal failed; will retry");
                    continue;
                }
            }
            self.follower_states.delete(&node.id);
        }
    }
}
