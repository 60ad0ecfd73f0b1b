//! openraft network over the cluster stream layer.
//!
//! One network client per peer. Connections are dialed lazily through the
//! stream layer, reused across RPCs, and dropped on any transport error so
//! the next RPC re-dials. Successful append-entries responses double as
//! leader-side contact observations feeding follower-state telemetry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bastion_cluster::RaftStreamLayer;
use bastion_cluster::TlsConn;
use openraft::error::InstallSnapshotError;
use openraft::error::NetworkError;
use openraft::error::RPCError;
use openraft::error::RaftError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use parking_lot::RwLock;
use tracing::debug;
use tracing::warn;

use crate::rpc::read_frame;
use crate::rpc::write_frame;
use crate::rpc::RaftRequest;
use crate::rpc::RaftResponse;
use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;

/// Default per-dial timeout for peer connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Leader-side record of when each peer last answered an RPC.
#[derive(Default)]
pub struct FollowerContacts {
    inner: RwLock<HashMap<String, Instant>>,
}

impl FollowerContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, server_id: &str) {
        self.inner.write().insert(server_id.to_string(), Instant::now());
    }

    pub fn last_contact(&self, server_id: &str) -> Option<Instant> {
        self.inner.read().get(server_id).copied()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Creates per-peer network clients over the stream layer.
#[derive(Clone)]
pub struct StreamNetworkFactory {
    layer: Arc<RaftStreamLayer>,
    contacts: Arc<FollowerContacts>,
    dial_timeout: Duration,
}

impl StreamNetworkFactory {
    pub fn new(layer: Arc<RaftStreamLayer>, contacts: Arc<FollowerContacts>) -> Self {
        Self {
            layer,
            contacts,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for StreamNetworkFactory {
    type Network = StreamNetwork;

    async fn new_client(&mut self, target: NodeId, node: &RaftServer) -> Self::Network {
        debug!(target, server = %node, "creating raft network client");
        StreamNetwork {
            target,
            server: node.clone(),
            layer: Arc::clone(&self.layer),
            contacts: Arc::clone(&self.contacts),
            dial_timeout: self.dial_timeout,
            conn: None,
        }
    }
}

/// Network client for a single peer.
pub struct StreamNetwork {
    #[allow(dead_code)]
    target: NodeId,
    server: RaftServer,
    layer: Arc<RaftStreamLayer>,
    contacts: Arc<FollowerContacts>,
    dial_timeout: Duration,
    conn: Option<TlsConn>,
}

impl StreamNetwork {
    async fn send_request(&mut self, request: &RaftRequest) -> Result<RaftResponse, std::io::Error> {
        if self.conn.is_none() {
            let addr: SocketAddr = self.server.address.parse().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid cluster address {:?}: {e}", self.server.address),
                )
            })?;
            let conn = self
                .layer
                .dial(addr, self.dial_timeout)
                .await
                .map_err(std::io::Error::other)?;
            self.conn = Some(conn);
        }

        let conn = self.conn.as_mut().expect("connection dialed above");
        let result = async {
            write_frame(conn, request).await?;
            read_frame::<RaftResponse, _>(conn).await
        }
        .await;

        if result.is_err() {
            // Drop the broken connection; the next RPC re-dials.
            self.conn = None;
        }
        result
    }
}

type AppendResult =
    Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, RaftServer, RaftError<NodeId>>>;
type VoteResult = Result<VoteResponse<NodeId>, RPCError<NodeId, RaftServer, RaftError<NodeId>>>;
type SnapshotResult = Result<
    InstallSnapshotResponse<NodeId>,
    RPCError<NodeId, RaftServer, RaftError<NodeId, InstallSnapshotError>>,
>;

fn unexpected_response() -> NetworkError {
    NetworkError::new(&std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "unexpected response type",
    ))
}

impl RaftNetwork<TypeConfig> for StreamNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> AppendResult {
        match self.send_request(&RaftRequest::AppendEntries(rpc)).await {
            Ok(RaftResponse::AppendEntries(response)) => {
                self.contacts.record(&self.server.id);
                Ok(response)
            }
            Ok(RaftResponse::Error(message)) => {
                Err(RPCError::Network(NetworkError::new(&std::io::Error::other(message))))
            }
            Ok(_) => Err(RPCError::Network(unexpected_response())),
            Err(err) => {
                warn!(server = %self.server, error = %err, "append_entries rpc failed");
                Err(RPCError::Unreachable(Unreachable::new(&err)))
            }
        }
    }

    async fn vote(&mut self, rpc: VoteRequest<NodeId>, _option: RPCOption) -> VoteResult {
        match self.send_request(&RaftRequest::Vote(rpc)).await {
            Ok(RaftResponse::Vote(response)) => Ok(response),
            Ok(RaftResponse::Error(message)) => {
                Err(RPCError::Network(NetworkError::new(&std::io::Error::other(message))))
            }
            Ok(_) => Err(RPCError::Network(unexpected_response())),
            Err(err) => {
                warn!(server = %self.server, error = %err, "vote rpc failed");
                Err(RPCError::Unreachable(Unreachable::new(&err)))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> SnapshotResult {
        match self.send_request(&RaftRequest::InstallSnapshot(rpc)).await {
            Ok(RaftResponse::InstallSnapshot(response)) => {
                self.contacts.record(&self.server.id);
                Ok(response)
            }
            Ok(RaftResponse::Error(message)) => {
                Err(RPCError::Network(NetworkError::new(&std::io::Error::other(message))))
            }
            Ok(_) => Err(RPCError::Network(unexpected_response())),
            Err(err) => {
                warn!(server = %self.server, error = %err, "install_snapshot rpc failed");
                Err(RPCError::Unreachable(Unreachable::new(&err)))
            }
        }
    }
}
