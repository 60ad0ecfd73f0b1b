//! Replicated TLS keyring.
//!
//! The keys that secure the cluster transport are themselves replicated
//! through raft so that a member joining after a rotation can still be
//! admitted. The keyring therefore keeps a bounded window of previous keys:
//! a peer presenting any key in the window is accepted while the rotation
//! propagates.

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::KeyGenerationSnafu;
use crate::ClusterError;

/// Number of superseded keys kept acceptable after a rotation.
pub const KEYRING_WINDOW: usize = 2;

/// One cluster transport key: a self-signed certificate and its private key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsKey {
    pub id: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
}

impl std::fmt::Debug for TlsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("TlsKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Ordered set of transport keys with one active key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsKeyring {
    pub keys: Vec<TlsKey>,
    pub active_key_id: String,
}

/// Keyring handle shared between the listener, stream layers, and the
/// rotation path. Consumers re-read it on every handshake, so a committed
/// rotation takes effect atomically on the next connection.
pub type SharedKeyring = Arc<RwLock<TlsKeyring>>;

impl TlsKeyring {
    /// Create a keyring with a single freshly generated active key.
    pub fn new() -> Result<Self, ClusterError> {
        let key = Self::generate_key()?;
        let active_key_id = key.id.clone();
        Ok(Self {
            keys: vec![key],
            active_key_id,
        })
    }

    /// Generate a new self-signed transport key.
    pub fn generate_key() -> Result<TlsKey, ClusterError> {
        let id = uuid::Uuid::new_v4().to_string();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![format!("{id}.bastion-cluster")])
                .context(KeyGenerationSnafu)?;
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(TlsKey {
            id,
            cert_der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
            created_at,
        })
    }

    pub fn active_key(&self) -> Result<&TlsKey, ClusterError> {
        self.keys
            .iter()
            .find(|k| k.id == self.active_key_id)
            .ok_or(ClusterError::NoActiveKey)
    }

    /// Append a freshly generated key, make it active, and retire keys that
    /// fall outside the acceptance window. Returns the new key's id.
    pub fn rotate(&mut self) -> Result<String, ClusterError> {
        let key = Self::generate_key()?;
        let id = key.id.clone();
        self.keys.push(key);
        self.active_key_id = id.clone();
        let excess = self.keys.len().saturating_sub(KEYRING_WINDOW + 1);
        if excess > 0 {
            self.keys.drain(..excess);
        }
        Ok(id)
    }

    /// True when `der` is the certificate of any key still in the window.
    pub fn contains_cert(&self, der: &[u8]) -> bool {
        self.keys.iter().any(|k| k.cert_der == der)
    }

    /// Certificates of every key in the window, newest last.
    pub fn all_certs(&self) -> Vec<Vec<u8>> {
        self.keys.iter().map(|k| k.cert_der.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keyring_has_active_key() {
        let keyring = TlsKeyring::new().unwrap();
        assert_eq!(keyring.keys.len(), 1);
        let active = keyring.active_key().unwrap();
        assert!(!active.cert_der.is_empty());
        assert!(!active.key_der.is_empty());
    }

    #[test]
    fn rotation_keeps_window_of_prior_keys() {
        let mut keyring = TlsKeyring::new().unwrap();
        let first_cert = keyring.active_key().unwrap().cert_der.clone();

        let rotated = keyring.rotate().unwrap();
        assert_eq!(keyring.active_key_id, rotated);
        // The superseded key is still acceptable.
        assert!(keyring.contains_cert(&first_cert));

        for _ in 0..KEYRING_WINDOW {
            keyring.rotate().unwrap();
        }
        // Enough rotations push the first key out of the window.
        assert!(!keyring.contains_cert(&first_cert));
        assert_eq!(keyring.keys.len(), KEYRING_WINDOW + 1);
    }

    #[test]
    fn keyring_roundtrips_through_serde() {
        let keyring = TlsKeyring::new().unwrap();
        let bytes = serde_json::to_vec(&keyring).unwrap();
        let decoded: TlsKeyring = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, keyring);
    }
}
