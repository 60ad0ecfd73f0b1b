//! Periodic raft log verification.
//!
//! Every interval the verifier re-hashes the entries covered by its previous
//! checkpoint and compares the digests; a mismatch means the stored log
//! changed underneath raft (bit rot, partial writes). It then records a new
//! checkpoint at the current tail. The leader additionally replicates a
//! one-byte checkpoint marker so the marker op type exercises the wire path
//! on every member; the marker is a state-machine no-op.

use std::time::Duration;

use openraft::RaftLogReader;
use tracing::error;
use tracing::info;

use crate::log_cache::CachedLogStore;
use crate::log_store::LogStore;

pub const DEFAULT_VERIFICATION_INTERVAL: Duration = Duration::from_secs(60);
pub const MINIMUM_VERIFICATION_INTERVAL: Duration = Duration::from_secs(10);

/// One verification round's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierReport {
    /// Nothing to verify yet.
    Empty,
    /// A fresh checkpoint was recorded.
    Checkpoint { index: u64 },
    /// The re-hash of a previously checkpointed range matched, and a fresh
    /// checkpoint was recorded.
    Verified { from: u64, to: u64 },
    /// The log changed under a recorded checkpoint.
    CorruptionDetected { from: u64, to: u64 },
}

/// Hashes log contents between checkpoints.
pub struct LogVerifier {
    reader: CachedLogStore<LogStore>,
    checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    first: u64,
    last: u64,
    digest: [u8; 32],
}

impl LogVerifier {
    pub fn new(reader: CachedLogStore<LogStore>) -> Self {
        Self {
            reader,
            checkpoint: None,
        }
    }

    /// Run one verification round.
    pub async fn run_once(&mut self) -> Result<VerifierReport, std::io::Error> {
        let entries = self
            .reader
            .try_get_log_entries(..)
            .await
            .map_err(std::io::Error::other)?;
        if entries.is_empty() {
            return Ok(VerifierReport::Empty);
        }
        let first = entries.first().map(|e| e.log_id.index).unwrap_or(0);
        let last = entries.last().map(|e| e.log_id.index).unwrap_or(0);

        let report = match self.checkpoint {
            // Re-verify the previously hashed range as long as it has not
            // been purged out from under us.
            Some(prior) if prior.first >= first && prior.last <= last => {
                let digest = hash_entries(
                    entries
                        .iter()
                        .filter(|e| e.log_id.index >= prior.first && e.log_id.index <= prior.last),
                );
                if digest != prior.digest {
                    error!(
                        from = prior.first,
                        to = prior.last,
                        "raft log verification failed: stored entries diverge from checkpoint"
                    );
                    return Ok(VerifierReport::CorruptionDetected {
                        from: prior.first,
                        to: prior.last,
                    });
                }
                VerifierReport::Verified {
                    from: prior.first,
                    to: prior.last,
                }
            }
            _ => VerifierReport::Checkpoint { index: last },
        };

        let digest = hash_entries(entries.iter());
        self.checkpoint = Some(Checkpoint {
            first,
            last,
            digest,
        });
        info!(first, last, "recorded raft log verifier checkpoint");
        Ok(report)
    }
}

fn hash_entries<'a>(
    entries: impl Iterator<Item = &'a openraft::Entry<crate::types::TypeConfig>>,
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for entry in entries {
        hasher.update(&entry.log_id.index.to_le_bytes());
        hasher.update(&entry.log_id.leader_id.term.to_le_bytes());
        if let openraft::EntryPayload::Normal(data) = &entry.payload {
            hasher.update(data);
        }
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use openraft::storage::RaftLogStorageExt;
    use openraft::EntryPayload;

    use super::*;
    use crate::fsm::test_log_id;
    use crate::log_store::RedbLogStore;
    use crate::types::TypeConfig;

    fn entry(index: u64, data: &[u8]) -> openraft::Entry<TypeConfig> {
        openraft::Entry {
            log_id: test_log_id(1, index),
            payload: EntryPayload::Normal(data.to_vec()),
        }
    }

    async fn store_with_entries(dir: &std::path::Path) -> CachedLogStore<LogStore> {
        let store = RedbLogStore::open(dir.join("raft.db")).unwrap();
        let mut cached = CachedLogStore::new(LogStore::Redb(store));
        cached
            .blocking_append((1..=4).map(|i| entry(i, b"stable")).collect::<Vec<_>>())
            .await
            .unwrap();
        cached
    }

    #[tokio::test]
    async fn clean_log_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut verifier = LogVerifier::new(store_with_entries(dir.path()).await);

        assert_eq!(verifier.run_once().await.unwrap(), VerifierReport::Checkpoint { index: 4 });
        assert_eq!(
            verifier.run_once().await.unwrap(),
            VerifierReport::Verified { from: 1, to: 4 }
        );
    }

    #[tokio::test]
    async fn rewritten_entry_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = store_with_entries(dir.path()).await;
        let mut verifier = LogVerifier::new(cached.clone());
        verifier.run_once().await.unwrap();

        // Overwrite index 2 with different bytes behind the verifier's back.
        cached.blocking_append([entry(2, b"tampered")]).await.unwrap();

        // Appending replaced the tail view; a divergent hash must surface.
        match verifier.run_once().await.unwrap() {
            VerifierReport::CorruptionDetected { from, to } => {
                assert_eq!((from, to), (1, 4));
            }
            other => panic!("expected corruption report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_log_reports_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("raft.db")).unwrap();
        let mut verifier = LogVerifier::new(CachedLogStore::new(LogStore::Redb(store)));
        assert_eq!(verifier.run_once().await.unwrap(), VerifierReport::Empty);
    }
}
