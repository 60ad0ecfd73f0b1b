//! Cluster-internal transport for bastion nodes.
//!
//! One TLS listener serves every cluster protocol. Protocols register a
//! handler under an ALPN identifier; the listener performs the handshake,
//! selects the handler for the negotiated protocol, and hands the connection
//! off. The raft transport is one such handler: [`RaftStreamLayer`] presents
//! an accept/dial surface to the raft engine while its inbound side is fed by
//! listener handoffs.
//!
//! Peer authentication is pinned to the replicated [`TlsKeyring`]: nodes
//! present the active key's certificate and accept any certificate still in
//! the keyring window, which is what lets a rotation commit through the very
//! transport it secures.

mod error;
mod keyring;
mod listener;
mod stream;
mod tls;

pub use error::ClusterError;
pub use keyring::SharedKeyring;
pub use keyring::TlsKey;
pub use keyring::TlsKeyring;
pub use keyring::KEYRING_WINDOW;
pub use listener::ClusterClient;
pub use listener::ClusterHandler;
pub use listener::ClusterListener;
pub use listener::ACCEPT_DEADLINE;
pub use listener::HANDSHAKE_TIMEOUT;
pub use stream::RaftStreamLayer;
pub use stream::TlsConn;
pub use stream::RAFT_STORAGE_ALPN;
pub use tls::client_tls_config;
pub use tls::server_tls_config;
