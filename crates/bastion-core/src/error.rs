//! Error taxonomy shared by all physical backends.

use snafu::Snafu;

/// Errors surfaced by physical backends.
///
/// The variant is the stable kind higher layers switch on; the message is
/// free-form. Mutating operations that fail with `EnqueueTimeout` never
/// advanced state and may be retried; a failed `ApplyFailed` likewise. A
/// caller that cannot tolerate "applied but response lost" must carry its own
/// deduplication key in the value.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    /// The backend is sealed; unseal before issuing operations.
    #[snafu(display("raft storage is sealed"))]
    Sealed,

    /// The backend has not finished initializing.
    #[snafu(display("raft storage is not initialized"))]
    NotInitialized,

    /// This node is not the leader; the caller forwards to the leader.
    #[snafu(display("node is not the leader"))]
    NotLeader {
        /// Cluster address of the current leader, when known.
        leader: Option<String>,
    },

    /// The replication queue did not accept the operation in time.
    #[snafu(display("append to the replication queue timed out; retryable"))]
    EnqueueTimeout,

    /// The committed entry failed to apply; state has not advanced.
    #[snafu(display("could not apply data"))]
    ApplyFailed,

    /// An entry exceeded the configured size limit.
    #[snafu(display("put failed due to value being too large; got {got} bytes, max: {max} bytes"))]
    ValueTooLarge { got: u64, max: u64 },

    /// A storage read or write failed.
    #[snafu(display("storage i/o error: {source}"))]
    Io { source: std::io::Error },

    /// Configuration rejected at construction.
    #[snafu(display("invalid configuration: {message}"))]
    InvalidConfiguration { message: String },

    /// Catch-all for backend-specific failures.
    #[snafu(display("{message}"))]
    Backend { message: String },
}

impl BackendError {
    /// True when retrying the same operation is safe without deduplication.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::EnqueueTimeout | BackendError::NotLeader { .. })
    }
}

impl From<std::io::Error> for BackendError {
    fn from(source: std::io::Error) -> Self {
        BackendError::Io { source }
    }
}
