//! rustls configuration for cluster connections.
//!
//! Cluster certificates are self-signed keys out of the replicated keyring,
//! so neither side chains to a CA: both directions pin the peer certificate
//! against the set of certificates currently in the keyring window. The
//! signature over the handshake transcript is still verified, which is what
//! proves possession of the pinned key.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::ring;
use rustls::crypto::verify_tls12_signature;
use rustls::crypto::verify_tls13_signature;
use rustls::crypto::CryptoProvider;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use rustls::server::danger::ClientCertVerified;
use rustls::server::danger::ClientCertVerifier;
use rustls::ClientConfig;
use rustls::DigitallySignedStruct;
use rustls::DistinguishedName;
use rustls::ServerConfig;
use rustls::SignatureScheme;
use snafu::ResultExt;

use crate::error::TlsConfigSnafu;
use crate::ClusterError;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn pinned_cert_error() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

/// Accepts exactly the certificates in `trusted` (DER equality).
#[derive(Debug)]
struct PinnedSet {
    trusted: Vec<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedSet {
    fn new(trusted: Vec<CertificateDer<'static>>, provider: &CryptoProvider) -> Self {
        Self {
            trusted,
            algorithms: provider.signature_verification_algorithms,
        }
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        if self.trusted.iter().any(|c| c.as_ref() == end_entity.as_ref()) {
            Ok(())
        } else {
            Err(pinned_cert_error())
        }
    }
}

/// Server-side verifier: the dialing peer must present a keyring cert.
#[derive(Debug)]
pub(crate) struct PinnedClientVerifier {
    pinned: PinnedSet,
    // Pinning does not narrow acceptable client cert issuers.
    root_hints: Vec<DistinguishedName>,
}

impl PinnedClientVerifier {
    pub(crate) fn new(trusted: Vec<CertificateDer<'static>>, provider: &CryptoProvider) -> Self {
        Self {
            pinned: PinnedSet::new(trusted, provider),
            root_hints: Vec::new(),
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.pinned.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.pinned.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.pinned.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.pinned.algorithms.supported_schemes()
    }
}

/// Client-side verifier: the dialed server must present a keyring cert.
#[derive(Debug)]
pub(crate) struct PinnedServerVerifier {
    pinned: PinnedSet,
}

impl PinnedServerVerifier {
    pub(crate) fn new(trusted: Vec<CertificateDer<'static>>, provider: &CryptoProvider) -> Self {
        Self {
            pinned: PinnedSet::new(trusted, provider),
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.pinned.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.pinned.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.pinned.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.pinned.algorithms.supported_schemes()
    }
}

/// Build the server configuration for one protocol handler.
///
/// The configuration presents `cert_der`/`key_der`, demands a client
/// certificate pinned to `trusted`, and offers exactly `alpn`.
pub fn server_tls_config(
    alpn: &[u8],
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    trusted: Vec<Vec<u8>>,
) -> Result<ServerConfig, ClusterError> {
    let provider = crypto_provider();
    let trusted: Vec<CertificateDer<'static>> =
        trusted.into_iter().map(CertificateDer::from).collect();
    let verifier = PinnedClientVerifier::new(trusted, &provider);

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context(TlsConfigSnafu)?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        )
        .context(TlsConfigSnafu)?;
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(config)
}

/// Build the client configuration for dialing a cluster peer.
///
/// Presents `cert_der`/`key_der` as the client certificate, accepts servers
/// pinned to `trusted`, and offers exactly `alpn`.
pub fn client_tls_config(
    alpn: &[u8],
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    trusted: Vec<Vec<u8>>,
) -> Result<ClientConfig, ClusterError> {
    let provider = crypto_provider();
    let trusted: Vec<CertificateDer<'static>> =
        trusted.into_iter().map(CertificateDer::from).collect();
    let verifier = PinnedServerVerifier::new(trusted, &provider);

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context(TlsConfigSnafu)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        )
        .context(TlsConfigSnafu)?;
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TlsKeyring;

    #[test]
    fn pinned_set_accepts_only_listed_certs() {
        let keyring = TlsKeyring::new().unwrap();
        let key = keyring.active_key().unwrap();
        let provider = crypto_provider();
        let pinned = PinnedSet::new(
            vec![CertificateDer::from(key.cert_der.clone())],
            &provider,
        );

        assert!(pinned.check(&CertificateDer::from(key.cert_der.clone())).is_ok());

        let other = TlsKeyring::generate_key().unwrap();
        assert!(pinned.check(&CertificateDer::from(other.cert_der)).is_err());
    }

    #[test]
    fn configs_build_from_keyring_material() {
        let keyring = TlsKeyring::new().unwrap();
        let key = keyring.active_key().unwrap();

        server_tls_config(
            b"raft_storage_v1",
            key.cert_der.clone(),
            key.key_der.clone(),
            keyring.all_certs(),
        )
        .unwrap();

        client_tls_config(
            b"raft_storage_v1",
            key.cert_der.clone(),
            key.key_der.clone(),
            keyring.all_certs(),
        )
        .unwrap();
    }
}
