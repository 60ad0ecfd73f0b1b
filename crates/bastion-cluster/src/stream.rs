//! Raft transport stream layer.
//!
//! Presents accept/dial to the raft engine. Inbound connections arrive via
//! listener handoff on the reserved raft ALPN; outbound connections dial the
//! peer's cluster port directly with a client config restricted to the same
//! ALPN and pinned to the replicated keyring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client_tls_config;
use crate::ClusterClient;
use crate::ClusterError;
use crate::ClusterHandler;
use crate::SharedKeyring;

/// ALPN identifier of the raft storage protocol.
pub const RAFT_STORAGE_ALPN: &[u8] = b"raft_storage_v1";

/// A cluster connection, either accepted or dialed.
pub type TlsConn = tokio_rustls::TlsStream<TcpStream>;

/// Depth of the inbound handoff queue. Connections beyond this wait in
/// `handoff` until the consumer catches up or a cancellation fires.
const HANDOFF_QUEUE_DEPTH: usize = 16;

/// Raft transport endpoint over the shared cluster listener.
#[derive(Debug)]
pub struct RaftStreamLayer {
    local_addr: SocketAddr,
    keyring: SharedKeyring,
    incoming_tx: mpsc::Sender<TlsConn>,
    incoming_rx: Mutex<mpsc::Receiver<TlsConn>>,
    closed: CancellationToken,
}

impl RaftStreamLayer {
    /// Create a layer advertising `local_addr` to peers.
    ///
    /// The address must be specified: peers dial it back, so `0.0.0.0`/`::`
    /// cannot work and is rejected at setup.
    pub fn new(local_addr: SocketAddr, keyring: SharedKeyring) -> Result<Self, ClusterError> {
        if local_addr.ip().is_unspecified() {
            return Err(ClusterError::UnspecifiedListenerAddr { addr: local_addr });
        }
        let (incoming_tx, incoming_rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
        Ok(Self {
            local_addr,
            keyring,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            closed: CancellationToken::new(),
        })
    }

    /// Address peers should dial to reach this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn keyring(&self) -> &SharedKeyring {
        &self.keyring
    }

    /// Block until a handed-off connection is available.
    ///
    /// Returns [`ClusterError::LayerClosed`] once the layer is closed; that
    /// error is terminal.
    pub async fn accept(&self) -> Result<TlsConn, ClusterError> {
        let mut rx = self.incoming_rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(ClusterError::LayerClosed),
            _ = self.closed.cancelled() => Err(ClusterError::LayerClosed),
        }
    }

    /// Dial a peer's cluster address on the raft ALPN.
    ///
    /// The server certificate is validated against the current keyring
    /// window, so peers still presenting a recently rotated-out key are
    /// accepted during the grace period.
    pub async fn dial(&self, addr: SocketAddr, dial_timeout: Duration) -> Result<TlsConn, ClusterError> {
        if self.closed.is_cancelled() {
            return Err(ClusterError::LayerClosed);
        }
        let config = {
            let keyring = self.keyring.read();
            let active = keyring.active_key()?;
            client_tls_config(
                RAFT_STORAGE_ALPN,
                active.cert_der.clone(),
                active.key_der.clone(),
                keyring.all_certs(),
            )?
        };
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::DialTimeout { addr })?
            .map_err(|source| ClusterError::Dial { addr, source })?;
        let server_name = rustls::pki_types::ServerName::IpAddress(addr.ip().into());
        let tls = timeout(dial_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ClusterError::DialTimeout { addr })?
            .map_err(|source| ClusterError::Dial { addr, source })?;
        Ok(TlsConn::from(tls))
    }

    /// Close the layer: `accept` returns a terminal error and queued
    /// handoffs are dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ClusterHandler for RaftStreamLayer {
    fn tls_identity(&self) -> Result<(Vec<u8>, Vec<u8>), ClusterError> {
        let keyring = self.keyring.read();
        let active = keyring.active_key()?;
        Ok((active.cert_der.clone(), active.key_der.clone()))
    }

    fn trusted_peer_certs(&self) -> Result<Vec<Vec<u8>>, ClusterError> {
        Ok(self.keyring.read().all_certs())
    }

    async fn handoff(&self, conn: TlsConn, shutdown: CancellationToken) -> Result<(), ClusterError> {
        // Wait only until the queue accepts the connection or any
        // cancellation fires; never stall the listener's accept path.
        tokio::select! {
            permit = self.incoming_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(conn);
                    Ok(())
                }
                Err(_) => Err(ClusterError::LayerClosed),
            },
            _ = self.closed.cancelled() => {
                debug!("dropping raft connection handed off after layer close");
                Err(ClusterError::LayerClosed)
            }
            _ = shutdown.cancelled() => {
                debug!("dropping raft connection during shutdown");
                Err(ClusterError::LayerClosed)
            }
        }
    }

    fn stop(&self) {
        self.close();
    }
}

impl ClusterClient for RaftStreamLayer {
    fn client_tls_config(&self) -> Result<Arc<rustls::ClientConfig>, ClusterError> {
        let keyring = self.keyring.read();
        let active = keyring.active_key()?;
        let config = client_tls_config(
            RAFT_STORAGE_ALPN,
            active.cert_der.clone(),
            active.key_der.clone(),
            keyring.all_certs(),
        )?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;
    use crate::TlsKeyring;

    fn test_keyring() -> SharedKeyring {
        Arc::new(RwLock::new(TlsKeyring::new().unwrap()))
    }

    #[test]
    fn unspecified_listener_address_is_rejected() {
        for addr in ["0.0.0.0:8201", "[::]:8201"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let err = RaftStreamLayer::new(addr, test_keyring()).unwrap_err();
            assert!(matches!(err, ClusterError::UnspecifiedListenerAddr { .. }));
        }
    }

    #[test]
    fn specified_listener_address_is_accepted() {
        let addr: SocketAddr = "127.0.0.1:8201".parse().unwrap();
        let layer = RaftStreamLayer::new(addr, test_keyring()).unwrap();
        assert_eq!(layer.local_addr(), addr);
    }

    #[tokio::test]
    async fn accept_after_close_is_terminal() {
        let addr: SocketAddr = "127.0.0.1:8201".parse().unwrap();
        let layer = RaftStreamLayer::new(addr, test_keyring()).unwrap();
        layer.close();
        assert!(matches!(layer.accept().await, Err(ClusterError::LayerClosed)));
        assert!(matches!(layer.accept().await, Err(ClusterError::LayerClosed)));
    }
}
