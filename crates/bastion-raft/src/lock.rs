//! HA lock rooted in raft leadership.
//!
//! Leadership itself is the mutual-exclusion primitive; acquiring the lock
//! means becoming leader, and the value written under the lock key exists so
//! standbys can observe the holder through ordinary reads. Unlocking is a
//! storage-layer no-op: stepping a node down is orchestrated above this
//! layer.

use std::sync::Arc;

use async_trait::async_trait;
use bastion_core::BackendError;
use bastion_core::HaLock;
use openraft::ServerState;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::backend::RaftBackend;
use crate::wire::LogData;
use crate::wire::LogOperation;

/// A lock scoped to one storage key.
pub struct RaftLock {
    backend: Arc<RaftBackend>,
    key: String,
    value: Vec<u8>,
}

impl RaftLock {
    pub(crate) fn new(backend: Arc<RaftBackend>, key: String, value: Vec<u8>) -> Self {
        Self { backend, key, value }
    }

    /// Spawn the leadership monitor: the returned token is cancelled when
    /// this node stops being leader (or the engine goes away).
    fn monitor_leadership(
        &self,
        mut metrics: tokio::sync::watch::Receiver<
            openraft::RaftMetrics<crate::types::NodeId, crate::types::RaftServer>,
        >,
        stop: CancellationToken,
    ) -> CancellationToken {
        let leader_lost = CancellationToken::new();
        let lost = leader_lost.clone();
        tokio::spawn(async move {
            loop {
                if metrics.borrow().state != ServerState::Leader {
                    debug!("leadership lost");
                    lost.cancel();
                    return;
                }
                tokio::select! {
                    changed = metrics.changed() => {
                        if changed.is_err() {
                            // The engine shut down; that is a loss too.
                            lost.cancel();
                            return;
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
        leader_lost
    }
}

#[async_trait]
impl HaLock for RaftLock {
    async fn lock(&self, stop: CancellationToken) -> Result<Option<CancellationToken>, BackendError> {
        let mut metrics = self.backend.leader_watch().await?;

        loop {
            if metrics.borrow().state == ServerState::Leader {
                break;
            }
            tokio::select! {
                changed = metrics.changed() => {
                    if changed.is_err() {
                        return Err(BackendError::Sealed);
                    }
                }
                _ = stop.cancelled() => return Ok(None),
            }
        }

        // We are leader: write the lock value so standbys can see the
        // holder.
        self.backend
            .apply_log(LogData::single(LogOperation::put(
                self.key.clone(),
                self.value.clone(),
            )))
            .await?;

        info!(key = %self.key, "acquired ha lock");
        Ok(Some(self.monitor_leadership(metrics, stop)))
    }

    async fn unlock(&self) -> Result<(), BackendError> {
        // Releasing leadership is external orchestration; the storage layer
        // has nothing to undo.
        Ok(())
    }

    async fn value(&self) -> Result<(bool, Vec<u8>), BackendError> {
        match self.backend.fsm().get(&self.key).await? {
            Some(entry) => Ok((true, entry.value)),
            None => Ok((false, Vec::new())),
        }
    }
}
