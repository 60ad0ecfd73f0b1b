//! Raft RPC framing and server-side dispatch.
//!
//! Requests and responses ride the TLS streams of the cluster listener as
//! length-prefixed bincode frames. One connection carries a sequence of
//! request/response pairs; the dialing side serializes its RPCs, so no
//! interleaving happens on a stream. Join requests from retry-join peers use
//! the same protocol and are answered by the leader.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bastion_cluster::RaftStreamLayer;
use bastion_cluster::TlsConn;
use openraft::error::ClientWriteError;
use openraft::error::RaftError;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use openraft::Raft;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::types::NodeId;
use crate::types::RaftServer;
use crate::types::TypeConfig;

/// Upper bound on one RPC frame; snapshots stream in engine-sized chunks
/// well below this.
pub const MAX_RPC_FRAME_SIZE: u32 = 32 * 1024 * 1024;

/// Replicated record prefix holding each server's suffrage intent; written
/// by the leader when admitting a member, read by the autopilot promoter.
pub const DESIRED_SUFFRAGE_PREFIX: &str = "core/raft/desired-suffrage/";

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    Join(JoinRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Join(JoinResponse),
    Error(String),
}

/// A retry-join peer asking to be admitted to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub server: RaftServer,
    pub non_voter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinResponse {
    Accepted,
    /// Redirect to the current leader, when known.
    NotLeader { leader: Option<RaftServer> },
}

pub(crate) async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &T,
) -> Result<(), std::io::Error> {
    let payload = bincode::serialize(message).map_err(std::io::Error::other)?;
    if payload.len() as u64 > MAX_RPC_FRAME_SIZE as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("rpc frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<T, std::io::Error> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_RPC_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("rpc frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(std::io::Error::other)
}

/// Send one join request to a peer's cluster address.
pub(crate) async fn send_join(
    layer: &RaftStreamLayer,
    addr: SocketAddr,
    request: &JoinRequest,
    timeout: Duration,
) -> Result<JoinResponse, std::io::Error> {
    let mut conn = layer.dial(addr, timeout).await.map_err(std::io::Error::other)?;
    write_frame(&mut conn, &RaftRequest::Join(request.clone())).await?;
    match read_frame::<RaftResponse, _>(&mut conn).await? {
        RaftResponse::Join(response) => Ok(response),
        RaftResponse::Error(message) => Err(std::io::Error::other(message)),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected response type for join",
        )),
    }
}

/// Spawn the inbound RPC dispatcher: accepts stream-layer connections and
/// drains each one's request frames into the raft engine.
pub(crate) fn spawn_rpc_server(
    raft: Raft<TypeConfig>,
    layer: Arc<RaftStreamLayer>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                conn = layer.accept() => conn,
                _ = shutdown.cancelled() => return,
            };
            let conn = match conn {
                Ok(conn) => conn,
                // Terminal: the layer is closed.
                Err(_) => return,
            };
            let raft = raft.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_peer(raft, conn, shutdown).await {
                    debug!(error = %err, "raft peer connection ended");
                }
            });
        }
    })
}

async fn serve_peer(
    raft: Raft<TypeConfig>,
    mut conn: TlsConn,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    loop {
        let request = tokio::select! {
            request = read_frame::<RaftRequest, _>(&mut conn) => request?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let response = dispatch(&raft, request).await;
        write_frame(&mut conn, &response).await?;
    }
}

async fn dispatch(raft: &Raft<TypeConfig>, request: RaftRequest) -> RaftResponse {
    match request {
        RaftRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
            Ok(response) => RaftResponse::AppendEntries(response),
            Err(err) => RaftResponse::Error(err.to_string()),
        },
        RaftRequest::Vote(rpc) => match raft.vote(rpc).await {
            Ok(response) => RaftResponse::Vote(response),
            Err(err) => RaftResponse::Error(err.to_string()),
        },
        RaftRequest::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
            Ok(response) => RaftResponse::InstallSnapshot(response),
            Err(err) => RaftResponse::Error(err.to_string()),
        },
        RaftRequest::Join(request) => handle_join(raft, request).await,
    }
}

/// Admit a joining server. Only the leader can; followers redirect.
async fn handle_join(raft: &Raft<TypeConfig>, request: JoinRequest) -> RaftResponse {
    let node_id = crate::types::raft_node_id(&request.server.id);

    // Record the joiner's suffrage intent in replicated storage first, so a
    // later leader's promoter still honors it.
    let suffrage = if request.non_voter { "non-voter" } else { "voter" };
    let record = crate::wire::LogData::single(crate::wire::LogOperation::put(
        format!("{DESIRED_SUFFRAGE_PREFIX}{}", request.server.id),
        suffrage.as_bytes().to_vec(),
    ));
    if let Err(err) = raft.client_write(record.encode_bytes()).await {
        if let Some(response) = forward_hint(&err) {
            return response;
        }
        return RaftResponse::Error(err.to_string());
    }

    info!(
        server = %request.server,
        non_voter = request.non_voter,
        "admitting server to cluster as learner"
    );
    match raft.add_learner(node_id, request.server.clone(), true).await {
        Ok(_) => RaftResponse::Join(JoinResponse::Accepted),
        Err(err) => {
            if let RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) = &err {
                return RaftResponse::Join(JoinResponse::NotLeader {
                    leader: forward.leader_node.clone(),
                });
            }
            warn!(server = %request.server, error = %err, "failed to admit joining server");
            RaftResponse::Error(err.to_string())
        }
    }
}

fn forward_hint(
    err: &RaftError<NodeId, ClientWriteError<NodeId, RaftServer>>,
) -> Option<RaftResponse> {
    if let RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) = err {
        return Some(RaftResponse::Join(JoinResponse::NotLeader {
            leader: forward.leader_node.clone(),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let request = RaftRequest::Join(JoinRequest {
            server: RaftServer::new("core-1", "127.0.0.1:8201"),
            non_voter: true,
        });
        write_frame(&mut a, &request).await.unwrap();
        let decoded: RaftRequest = read_frame(&mut b).await.unwrap();
        match decoded {
            RaftRequest::Join(join) => {
                assert_eq!(join.server.id, "core-1");
                assert!(join.non_voter);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            // A fake length prefix far beyond the limit.
            let _ = a.write_all(&u32::MAX.to_le_bytes()).await;
        });
        let result: Result<RaftRequest, _> = read_frame(&mut b).await;
        assert!(result.is_err());
    }
}
