//! openraft type configuration for the bastion backend.

use std::io::Cursor;

use openraft::RaftTypeConfig;
use serde::Deserialize;
use serde::Serialize;

/// Wire-level raft node identifier.
///
/// The durable identity of a node is its string server id (a UUID persisted
/// under the data directory); the engine-level id is a stable 64-bit digest
/// of it, see [`raft_node_id`].
pub type NodeId = u64;

/// Type configuration for the bastion raft backend.
///
/// - `D`: an encoded `LogData` record (see [`crate::wire`])
/// - `R`: the apply outcome, including read-backs for get operations
/// - `Node`: server id and cluster address carried in the membership config
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = Vec<u8>;
    type R = ApplyResult;
    type NodeId = NodeId;
    type Node = RaftServer;
    type Entry = openraft::Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

/// Membership metadata for one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RaftServer {
    /// Durable string server id.
    pub id: String,
    /// Cluster address peers dial for raft traffic, `host:port`.
    pub address: String,
}

impl RaftServer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for RaftServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl std::error::Error for RaftServer {}

/// Outcome of applying one log entry to the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    /// Read-backs for get operations, in operation order.
    pub entries: Vec<FsmEntry>,
}

impl ApplyResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            entries: Vec::new(),
        }
    }
}

/// A key/value pair read back out of the state machine during apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Derive the stable engine-level node id from a string server id.
///
/// First eight bytes of `blake3(id)`, little-endian. Stable across processes
/// and releases, which is what lets peers compute each other's ids from
/// membership metadata alone.
pub fn raft_node_id(server_id: &str) -> NodeId {
    let digest = blake3::hash(server_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_and_distinct() {
        let a = raft_node_id("core-0");
        assert_eq!(a, raft_node_id("core-0"));
        assert_ne!(a, raft_node_id("core-1"));
        assert_ne!(a, 0);
    }

    #[test]
    fn server_display_includes_id_and_address() {
        let server = RaftServer::new("core-0", "127.0.0.1:8201");
        assert_eq!(server.to_string(), "core-0@127.0.0.1:8201");
    }
}
