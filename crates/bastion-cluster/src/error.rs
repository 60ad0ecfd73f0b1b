//! Cluster transport errors.

use std::net::SocketAddr;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClusterError {
    /// The stream layer needs a concrete address peers can dial back.
    #[snafu(display("cannot use unspecified listener address {addr}"))]
    UnspecifiedListenerAddr { addr: SocketAddr },

    #[snafu(display("failed to bind cluster listener on {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("a handler is already registered for ALPN {alpn:?}"))]
    HandlerExists { alpn: String },

    #[snafu(display("failed to generate cluster key: {source}"))]
    KeyGeneration { source: rcgen::Error },

    #[snafu(display("keyring has no active key"))]
    NoActiveKey,

    #[snafu(display("failed to assemble TLS configuration: {source}"))]
    TlsConfig { source: rustls::Error },

    #[snafu(display("TLS handshake failed: {source}"))]
    Handshake { source: std::io::Error },

    #[snafu(display("connection to {addr} failed: {source}"))]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("connection to {addr} timed out"))]
    DialTimeout { addr: SocketAddr },

    /// Terminal: the layer was closed and accepts no further connections.
    #[snafu(display("cluster stream layer is closed"))]
    LayerClosed,

    #[snafu(display("cluster i/o error: {source}"))]
    Io { source: std::io::Error },
}
