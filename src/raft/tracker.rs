use std::collections::HashMap;

use crate::raft::NodeId;

/// Per-peer replication progress, valid only for one leader term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTracker {
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    /// Bumped by [`rewind`](Self::rewind); replies to requests built under
    /// an older generation are not recorded.
    generation: u64,
}

/// What the leader does after a rejected AppendEntries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `next_index` moved down, send again
    Retry,
    /// Cannot roll back past the matched point
    GiveUp,
}

impl ReplicationTracker {
    /// Fresh tracker: `next_index = last_log_index + 1`, `match_index = 0`.
    pub fn new(peer_ids: &[NodeId], last_log_index: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &peer_id in peer_ids {
            next_index.insert(peer_id, last_log_index + 1);
            match_index.insert(peer_id, 0);
        }
        Self {
            next_index,
            match_index,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn next_index(&self, peer_id: NodeId) -> u64 {
        self.next_index.get(&peer_id).copied().unwrap_or(1)
    }

    pub fn match_index(&self, peer_id: NodeId) -> u64 {
        self.match_index.get(&peer_id).copied().unwrap_or(0)
    }

    /// Record an accepted AppendEntries. `matched` is the last index the
    /// peer is now known to share with the leader.
    pub fn record_success(&mut self, peer_id: NodeId, matched: u64) {
        let matched = matched.max(self.match_index(peer_id));
        self.match_index.insert(peer_id, matched);
        self.next_index.insert(peer_id, matched + 1);
    }

    /// Record a heartbeat accepted by a caught-up peer.
    pub fn record_heartbeat(&mut self, peer_id: NodeId, prev_log_index: u64, leader_last: u64) {
        let current = self.match_index(peer_id);
        self.match_index.insert(peer_id, current.max(prev_log_index));
        self.next_index.insert(peer_id, (leader_last + 1).max(1));
    }

    /// Move `next_index` down after a consistency rejection.
    pub fn back_off(&mut self, peer_id: NodeId, leader_last: u64) -> Backoff {
        let next = self.next_index(peer_id);
        let matched = self.match_index(peer_id);

        if next > leader_last + 1 {
            self.next_index.insert(peer_id, (leader_last + 1).max(1));
            Backoff::Retry
        } else if next > matched && next > 1 {
            self.next_index.insert(peer_id, next - 1);
            Backoff::Retry
        } else {
            Backoff::GiveUp
        }
    }

    /// The leader rewrote its log from `from_index`: no peer is known to
    /// hold those entries any more, so they are sent again before counting.
    pub fn rewind(&mut self, from_index: u64) {
        let floor = from_index.saturating_sub(1);
        for matched in self.match_index.values_mut() {
            *matched = (*matched).min(floor);
        }
        for next in self.next_index.values_mut() {
            *next = (*next).min(from_index.max(1));
        }
        self.generation += 1;
    }

    /// Highest index replicated on a strict majority of the cluster. The
    /// leader's own log counts as one fully matched member.
    pub fn majority_match_index(&self, leader_last: u64, cluster_size: usize) -> u64 {
        let mut matched: Vec<u64> = self.match_index.values().copied().collect();
        matched.push(leader_last);
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let majority = cluster_size / 2 + 1;
        matched
            .get(majority.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracker_initializes_indices() {
        let tracker = ReplicationTracker::new(&[1, 2], 4);
        assert_eq!(tracker.next_index(1), 5);
        assert_eq!(tracker.next_index(2), 5);
        assert_eq!(tracker.match_index(1), 0);
        assert_eq!(tracker.match_index(2), 0);
    }

    #[test]
    fn success_advances_match_and_next() {
        let mut tracker = ReplicationTracker::new(&[1], 0);
        tracker.record_success(1, 3);
        assert_eq!(tracker.match_index(1), 3);
        assert_eq!(tracker.next_index(1), 4);

        // A late reply for an older batch never lowers match_index
        tracker.record_success(1, 2);
        assert_eq!(tracker.match_index(1), 3);
    }

    #[test]
    fn heartbeat_snaps_next_to_leader_tail() {
        let mut tracker = ReplicationTracker::new(&[1], 2);
        tracker.record_heartbeat(1, 2, 2);
        assert_eq!(tracker.next_index(1), 3);
        assert_eq!(tracker.match_index(1), 2);
    }

    #[test]
    fn back_off_snaps_overshoot_then_decrements() {
        let mut tracker = ReplicationTracker::new(&[1], 5);
        tracker.next_index.insert(1, 9);

        assert_eq!(tracker.back_off(1, 5), Backoff::Retry);
        assert_eq!(tracker.next_index(1), 6);

        assert_eq!(tracker.back_off(1, 5), Backoff::Retry);
        assert_eq!(tracker.next_index(1), 5);
    }

    #[test]
    fn back_off_stops_at_match_index() {
        let mut tracker = ReplicationTracker::new(&[1], 3);
        tracker.record_success(1, 2);
        tracker.next_index.insert(1, 2);

        assert_eq!(tracker.back_off(1, 3), Backoff::GiveUp);
        assert_eq!(tracker.next_index(1), 2);
    }

    #[test]
    fn back_off_keeps_next_index_positive() {
        let mut tracker = ReplicationTracker::new(&[1], 0);
        assert_eq!(tracker.next_index(1), 1);
        assert_eq!(tracker.back_off(1, 0), Backoff::GiveUp);
        assert_eq!(tracker.next_index(1), 1);
    }

    #[test]
    fn rewind_forgets_matches_from_index() {
        let mut tracker = ReplicationTracker::new(&[1, 2], 5);
        tracker.record_success(1, 5);
        tracker.record_success(2, 2);
        let before = tracker.generation();

        tracker.rewind(3);
        assert_eq!(tracker.match_index(1), 2);
        assert_eq!(tracker.next_index(1), 3);
        // Below the rewound point nothing changes
        assert_eq!(tracker.match_index(2), 2);
        assert_eq!(tracker.next_index(2), 3);
        assert_eq!(tracker.generation(), before + 1);
    }

    #[test]
    fn majority_match_three_nodes() {
        let mut tracker = ReplicationTracker::new(&[1, 2], 0);
        assert_eq!(tracker.majority_match_index(5, 3), 0);

        tracker.record_success(1, 4);
        assert_eq!(tracker.majority_match_index(5, 3), 4);

        tracker.record_success(2, 5);
        assert_eq!(tracker.majority_match_index(5, 3), 5);
    }

    #[test]
    fn majority_match_four_nodes_needs_three() {
        let mut tracker = ReplicationTracker::new(&[1, 2, 3], 0);
        tracker.record_success(1, 7);
        // leader + one peer is not a majority of four
        assert_eq!(tracker.majority_match_index(7, 4), 0);

        tracker.record_success(2, 6);
        assert_eq!(tracker.majority_match_index(7, 4), 6);
    }

    #[test]
    fn majority_match_five_nodes() {
        let mut tracker = ReplicationTracker::new(&[1, 2, 3, 4], 0);
        tracker.record_success(1, 3);
        tracker.record_success(2, 8);
        tracker.record_success(3, 1);
        assert_eq!(tracker.majority_match_index(9, 5), 3);
    }

    #[test]
    fn single_node_cluster_commits_own_tail() {
        let tracker = ReplicationTracker::new(&[], 0);
        assert_eq!(tracker.majority_match_index(4, 1), 4);
    }
}
