//! Raft-replicated physical storage backend.
//!
//! A raft log drives a deterministic state machine whose state is a sorted
//! key/value store in a single-file B+-tree. The backend exposes the
//! physical [`Backend`](bastion_core::Backend) contract plus an HA lock
//! rooted in raft leadership, peer management, and snapshot administration.
//! Raft traffic rides the shared cluster listener via the
//! [`RaftStreamLayer`](bastion_cluster::RaftStreamLayer).
//!
//! # Key Components
//!
//! - `Fsm`: the state machine over redb (`data`/`config`/`latest` tables)
//! - `RedbLogStore` / `WalLogStore` / `CachedLogStore`: the raft log family
//! - `SnapshotStore`: FSM-rooted and file-rooted snapshots
//! - `StreamNetworkFactory`: openraft networking over TLS streams
//! - `RaftBackend`: composition root, seal/unseal lifecycle, physical K/V
//! - `Autopilot` + `FollowerStates`: topology health and promotion control

pub mod autopilot;
pub mod backend;
pub mod config;
pub mod follower;
pub mod fsm;
pub mod lock;
pub mod log_cache;
pub mod log_store;
pub mod network;
pub mod rpc;
pub mod snapshot;
pub mod types;
pub mod verifier;
pub mod wal;
pub mod wire;

pub use autopilot::Autopilot;
pub use autopilot::AutopilotConfig;
pub use autopilot::AutopilotServerInfo;
pub use autopilot::AutopilotState;
pub use backend::register_backend;
pub use backend::Peer;
pub use backend::RaftBackend;
pub use backend::SetupOptions;
pub use config::RaftBackendConfig;
pub use follower::FollowerStates;
pub use fsm::Fsm;
pub use lock::RaftLock;
pub use snapshot::SnapshotStore;
pub use types::raft_node_id;
pub use types::ApplyResult;
pub use types::RaftServer;
pub use types::TypeConfig;
