//! Per-peer telemetry held by the leader.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// What the leader knows about one follower.
#[derive(Debug, Clone, Default)]
pub struct FollowerState {
    pub applied_index: u64,
    /// Absent until the follower has reported a non-zero applied index.
    pub last_heartbeat: Option<Instant>,
    pub last_term: u64,
    /// Shared across clones so a mark-dead is visible through copies.
    pub is_dead: Arc<AtomicBool>,
    pub desired_suffrage: String,
    pub upgrade_version: Option<String>,
    pub redundancy_zone: Option<String>,
}

impl FollowerState {
    pub fn is_dead(&self) -> bool {
        self.is_dead.load(Ordering::SeqCst)
    }
}

/// One observed follower heartbeat.
#[derive(Debug, Clone)]
pub struct FollowerUpdate {
    pub node_id: String,
    pub applied_index: u64,
    pub term: u64,
    pub desired_suffrage: String,
    pub upgrade_version: Option<String>,
    pub redundancy_zone: Option<String>,
}

/// Information about every follower, tracked on the active node.
#[derive(Default)]
pub struct FollowerStates {
    followers: RwLock<HashMap<String, FollowerState>>,
}

impl FollowerStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one heartbeat into the map. Returns true when the peer was not
    /// tracked before. The heartbeat timestamp advances only for peers that
    /// report a non-zero applied index, which guards against spurious
    /// zero-state messages from nodes that have not caught up at all.
    pub fn update(&self, update: &FollowerUpdate) -> bool {
        let mut followers = self.followers.write();
        let existed = followers.contains_key(&update.node_id);
        let state = followers.entry(update.node_id.clone()).or_default();

        state.is_dead.store(false, Ordering::SeqCst);
        state.applied_index = update.applied_index;
        state.last_term = update.term;
        state.desired_suffrage = update.desired_suffrage.clone();
        state.upgrade_version = update.upgrade_version.clone();
        state.redundancy_zone = update.redundancy_zone.clone();
        if update.applied_index > 0 {
            state.last_heartbeat = Some(Instant::now());
        }

        !existed
    }

    /// Declare a follower dead; cleared again by the next live update.
    pub fn mark_dead(&self, node_id: &str) {
        let followers = self.followers.read();
        if let Some(state) = followers.get(node_id) {
            state.is_dead.store(true, Ordering::SeqCst);
        }
    }

    pub fn delete(&self, node_id: &str) {
        self.followers.write().remove(node_id);
    }

    pub fn clear(&self) {
        self.followers.write().clear();
    }

    pub fn get(&self, node_id: &str) -> Option<FollowerState> {
        self.followers.read().get(node_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.followers.read().keys().cloned().collect()
    }

    /// The minimum applied index across all tracked followers, 0 when none
    /// are tracked. Bounds how far the leader may truncate its log while
    /// keeping every follower catchable-up.
    pub fn min_index(&self) -> u64 {
        let followers = self.followers.read();
        followers
            .values()
            .map(|state| state.applied_index)
            .min()
            .unwrap_or(0)
    }

    /// Snapshot the map for reporting.
    pub fn all(&self) -> HashMap<String, FollowerState> {
        self.followers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(node_id: &str, applied_index: u64) -> FollowerUpdate {
        FollowerUpdate {
            node_id: node_id.to_string(),
            applied_index,
            term: 1,
            desired_suffrage: "voter".to_string(),
            upgrade_version: None,
            redundancy_zone: None,
        }
    }

    #[test]
    fn update_creates_then_modifies() {
        let states = FollowerStates::new();
        assert!(states.update(&update("core-1", 5)));
        assert!(!states.update(&update("core-1", 9)));
        assert_eq!(states.get("core-1").unwrap().applied_index, 9);
    }

    #[test]
    fn zero_applied_index_does_not_stamp_heartbeat() {
        let states = FollowerStates::new();
        states.update(&update("core-1", 0));
        assert!(states.get("core-1").unwrap().last_heartbeat.is_none());

        states.update(&update("core-1", 1));
        assert!(states.get("core-1").unwrap().last_heartbeat.is_some());
    }

    #[test]
    fn min_index_over_followers() {
        let states = FollowerStates::new();
        assert_eq!(states.min_index(), 0);

        states.update(&update("core-1", 10));
        states.update(&update("core-2", 4));
        assert_eq!(states.min_index(), 4);

        states.delete("core-2");
        assert_eq!(states.min_index(), 10);
    }

    #[test]
    fn mark_dead_is_visible_through_copies_and_reset_by_update() {
        let states = FollowerStates::new();
        states.update(&update("core-1", 3));
        let copy = states.get("core-1").unwrap();

        states.mark_dead("core-1");
        assert!(copy.is_dead());

        states.update(&update("core-1", 4));
        assert!(!copy.is_dead());
    }

    #[test]
    fn clear_wipes_everything() {
        let states = FollowerStates::new();
        states.update(&update("core-1", 1));
        states.update(&update("core-2", 2));
        states.clear();
        assert!(states.ids().is_empty());
        assert_eq!(states.min_index(), 0);
    }
}
