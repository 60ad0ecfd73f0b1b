//! High-availability lock contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Backend;
use crate::BackendError;

/// A backend that can arbitrate a single active node.
pub trait HaBackend: Backend {
    fn ha_enabled(&self) -> bool;

    /// Create a lock scoped to `key`; `value` is written once the lock is won
    /// so that standbys can observe the holder through ordinary reads.
    fn lock_with(&self, key: String, value: Vec<u8>) -> Result<Box<dyn HaLock>, BackendError>;
}

/// A single distributed lock.
#[async_trait]
pub trait HaLock: Send + Sync {
    /// Block until the lock is acquired or `stop` fires.
    ///
    /// On success returns a token that is cancelled when the lock is lost
    /// (for the raft backend: when leadership is lost). Returns `None` when
    /// `stop` fired before acquisition.
    async fn lock(&self, stop: CancellationToken) -> Result<Option<CancellationToken>, BackendError>;

    /// Release the lock. Storage-layer implementations may treat this as a
    /// no-op when the lock is an artifact of leadership.
    async fn unlock(&self) -> Result<(), BackendError>;

    /// Read the lock value: `(held, value)`.
    async fn value(&self) -> Result<(bool, Vec<u8>), BackendError>;
}
