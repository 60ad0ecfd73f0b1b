//! Process-wide cluster listener.
//!
//! Accepts TLS connections on every configured address, selects the protocol
//! handler for the first ALPN the peer offers that has a registration, and
//! hands the established connection off. Handler and client maps can change
//! at runtime; every handshake reads the current registrations, so a stream
//! layer registered after the listener started is picked up immediately.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::BindSnafu;
use crate::server_tls_config;
use crate::ClusterError;
use crate::TlsConn;

/// How long one `accept` may block before the shutdown flag is rechecked.
pub const ACCEPT_DEADLINE: Duration = Duration::from_millis(500);

/// Deadline for completing the TLS handshake on an accepted connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A protocol served on the cluster port, registered under an ALPN.
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    /// Certificate chain and private key (DER) this handler presents.
    fn tls_identity(&self) -> Result<(Vec<u8>, Vec<u8>), ClusterError>;

    /// Peer certificates (DER) acceptable for inbound connections.
    fn trusted_peer_certs(&self) -> Result<Vec<Vec<u8>>, ClusterError>;

    /// Take ownership of an established connection.
    ///
    /// Must not block the accept loop: implementations wait only until the
    /// connection is enqueued or any of their cancellation signals fire, then
    /// drop the connection.
    async fn handoff(&self, conn: TlsConn, shutdown: CancellationToken) -> Result<(), ClusterError>;

    /// Stop the handler; called by `stop_handler` on deregistration.
    fn stop(&self);
}

/// Outbound TLS configuration source for a protocol.
pub trait ClusterClient: Send + Sync {
    fn client_tls_config(&self) -> Result<Arc<rustls::ClientConfig>, ClusterError>;
}

type HandlerMap = Arc<RwLock<HashMap<Vec<u8>, Arc<dyn ClusterHandler>>>>;

/// Single TLS-accepting entry point for all cluster-internal protocols.
pub struct ClusterListener {
    addrs: Vec<SocketAddr>,
    handlers: HandlerMap,
    clients: RwLock<HashMap<Vec<u8>, Arc<dyn ClusterClient>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    bound: Mutex<Vec<SocketAddr>>,
}

impl ClusterListener {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            clients: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` under `alpn`. At most one handler per ALPN.
    pub fn add_handler(
        &self,
        alpn: &[u8],
        handler: Arc<dyn ClusterHandler>,
    ) -> Result<(), ClusterError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(alpn) {
            return Err(ClusterError::HandlerExists {
                alpn: String::from_utf8_lossy(alpn).into_owned(),
            });
        }
        handlers.insert(alpn.to_vec(), handler);
        Ok(())
    }

    /// Deregister and stop the handler under `alpn`, if any.
    pub fn stop_handler(&self, alpn: &[u8]) {
        let handler = self.handlers.write().remove(alpn);
        if let Some(handler) = handler {
            handler.stop();
        }
    }

    pub fn add_client(&self, alpn: &[u8], client: Arc<dyn ClusterClient>) {
        self.clients.write().insert(alpn.to_vec(), client);
    }

    pub fn remove_client(&self, alpn: &[u8]) {
        self.clients.write().remove(alpn);
    }

    pub fn get_client(&self, alpn: &[u8]) -> Option<Arc<dyn ClusterClient>> {
        self.clients.read().get(alpn).cloned()
    }

    /// Addresses actually bound by [`run`](Self::run); useful when the
    /// configured addresses use port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().clone()
    }

    /// Bind every configured address and start the accept loops.
    ///
    /// Returns once all listeners are bound; accept loops run until
    /// [`stop`](Self::stop).
    pub async fn run(&self) -> Result<(), ClusterError> {
        let mut listeners = Vec::with_capacity(self.addrs.len());
        for addr in &self.addrs {
            let listener = TcpListener::bind(addr).await.context(BindSnafu { addr: *addr })?;
            let local = listener.local_addr().context(BindSnafu { addr: *addr })?;
            self.bound.lock().push(local);
            info!(address = %local, "starting listener");
            listeners.push(listener);
        }

        for listener in listeners {
            let handlers = Arc::clone(&self.handlers);
            let shutdown = self.shutdown.clone();
            let tracker = self.tracker.clone();
            self.tracker.spawn(async move {
                accept_loop(listener, handlers, shutdown, tracker).await;
            });
        }
        Ok(())
    }

    /// Stop accepting, then wait for in-flight handoffs to drain.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let handlers: Vec<Arc<dyn ClusterHandler>> =
            self.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.stop();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: HandlerMap,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        // The deadline keeps shutdown responsive without a dedicated signal
        // path through the TCP accept.
        let accepted = match timeout(ACCEPT_DEADLINE, listener.accept()).await {
            Err(_elapsed) => continue,
            Ok(Err(err)) => {
                if shutdown.is_cancelled() {
                    return;
                }
                warn!(error = %err, "error accepting cluster connection");
                continue;
            }
            Ok(Ok(accepted)) => accepted,
        };

        let (tcp, peer) = accepted;
        let handlers = Arc::clone(&handlers);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            if let Err(err) = serve_connection(tcp, peer, handlers, shutdown).await {
                debug!(peer = %peer, error = %err, "dropping cluster connection");
            }
        });
    }
}

/// Handshake one accepted connection and hand it to its protocol handler.
async fn serve_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    handlers: HandlerMap,
    shutdown: CancellationToken,
) -> Result<(), ClusterError> {
    let handshake = async {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp)
            .await
            .map_err(|source| ClusterError::Handshake { source })?;

        // Resolve the handler from the client's offered protocols; its
        // identity and trust set shape the rest of the handshake.
        let selected = {
            let hello = start.client_hello();
            let handlers = handlers.read();
            hello.alpn().into_iter().flatten().find_map(|proto| {
                handlers.get(proto).cloned().map(|handler| (proto.to_vec(), handler))
            })
        };

        let Some((alpn, handler)) = selected else {
            debug!(peer = %peer, "no TLS handler found for offered protocols");
            return Ok(None);
        };

        let (cert_der, key_der) = handler.tls_identity()?;
        let trusted = handler.trusted_peer_certs()?;
        let config = server_tls_config(&alpn, cert_der, key_der, trusted)?;
        let tls = start
            .into_stream(Arc::new(config))
            .await
            .map_err(|source| ClusterError::Handshake { source })?;
        Ok(Some((handler, tls)))
    };

    let handed = timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| ClusterError::Handshake {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out"),
        })??;

    let Some((handler, tls)) = handed else {
        return Ok(());
    };

    // Handoff failures are logged by the caller; the accept loop never bails.
    handler.handoff(TlsConn::from(tls), shutdown.child_token()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl ClusterHandler for NullHandler {
        fn tls_identity(&self) -> Result<(Vec<u8>, Vec<u8>), ClusterError> {
            Err(ClusterError::NoActiveKey)
        }

        fn trusted_peer_certs(&self) -> Result<Vec<Vec<u8>>, ClusterError> {
            Ok(Vec::new())
        }

        async fn handoff(
            &self,
            _conn: TlsConn,
            _shutdown: CancellationToken,
        ) -> Result<(), ClusterError> {
            Ok(())
        }

        fn stop(&self) {}
    }

    #[test]
    fn duplicate_handler_registration_is_rejected() {
        let listener = ClusterListener::new(vec![]);
        listener.add_handler(b"proto_v1", Arc::new(NullHandler)).unwrap();
        let err = listener.add_handler(b"proto_v1", Arc::new(NullHandler)).unwrap_err();
        assert!(matches!(err, ClusterError::HandlerExists { .. }));
    }

    #[tokio::test]
    async fn stop_with_no_listeners_drains_cleanly() {
        let listener = ClusterListener::new(vec![]);
        listener.run().await.unwrap();
        listener.stop().await;
        assert!(listener.local_addrs().is_empty());
    }
}
