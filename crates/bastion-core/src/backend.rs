//! The physical backend contract.

use async_trait::async_trait;

use crate::BackendError;
use crate::Entry;
use crate::TxnEntry;

/// Durable key/value storage consumed by higher layers.
///
/// Implementations must provide read-after-write consistency for a single
/// caller: once `put` returns, a `get` issued by the same process observes the
/// write. `list` returns names directly under `prefix` in lexicographic
/// order: leaves as-is, sub-folders truncated to their first segment plus `/`
/// and deduplicated.
#[async_trait]
pub trait Backend: std::fmt::Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError>;

    async fn put(&self, entry: Entry) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Apply the operations atomically, in order: all or none.
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<(), BackendError>;
}
