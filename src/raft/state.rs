use std::collections::HashSet;

use crate::config::NodeConfig;
use crate::raft::log::{Command, Log};
use crate::raft::timer::Deadlines;
use crate::raft::tracker::ReplicationTracker;
use crate::raft::NodeId;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Term, vote and log. Would be written to stable storage before any
/// reply that depends on it in a durable deployment.
#[derive(Debug, Clone, Default)]
pub struct PersistentState {
    pub current_term: u64,
    /// Candidate that received this node's vote in `current_term`
    pub voted_for: Option<NodeId>,
    pub log: Log,
}

/// Everything a replica owns, guarded as one unit.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term:
/// - `voted_for` is only cleared when `current_term` advances
/// - A candidate needs votes from a strict majority
///
/// ## Log Matching
/// - AppendEntries consistency check on `(prev_log_index, prev_log_term)`
/// - Followers only truncate above their `commit_index`
///
/// ## Leader Completeness
/// - Votes require the candidate's log to be at least as up to date
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// - Entries are applied in index order, exactly up to `commit_index`
/// - `commit_index` never decreases
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub peer_ids: Vec<NodeId>,
    pub cluster_size: usize,
    majority: usize,

    pub persistent: PersistentState,

    // Volatile state on all servers
    pub role: RaftRole,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub tracker: Option<ReplicationTracker>,
    /// Peers with a replication task in flight
    pub replicating: HashSet<NodeId>,

    pub deadlines: Deadlines,
}

impl RaftState {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id,
            peer_ids: config.peer_ids(),
            cluster_size: config.cluster_size(),
            majority: config.majority(),
            persistent: PersistentState::default(),
            role: RaftRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            tracker: None,
            replicating: HashSet::new(),
            deadlines: Deadlines::new(config.timing.clone()),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.persistent.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.persistent.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.persistent.log
    }

    pub fn last_log_index(&self) -> u64 {
        self.persistent.log.last_entry_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.persistent.log.last_entry_term()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// Strict majority of the cluster, self included.
    pub fn has_majority(&self, votes: usize) -> bool {
        votes >= self.majority
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Step down. A higher term clears the vote; the same term keeps it so
    /// that at most one vote is ever granted per term.
    pub fn become_follower(&mut self, term: u64, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        if self.role != RaftRole::Follower {
            tracing::info!(
                node_id = self.node_id,
                term,
                from = %self.role,
                "Stepping down to follower"
            );
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader_id;
        self.tracker = None;
        self.deadlines.reset_election();
    }

    /// Return to follower after an election round without a majority,
    /// keeping term, vote and leader knowledge.
    pub fn revert_to_follower(&mut self) {
        self.role = RaftRole::Follower;
        self.tracker = None;
        self.deadlines.reset_election();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.tracker = None;
        self.deadlines.reset_election();
    }

    /// Transition to leader state
    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id);
        self.tracker = Some(ReplicationTracker::new(
            &self.peer_ids,
            self.last_log_index(),
        ));
        self.deadlines.reset_heartbeat();
    }

    /// Leader-side client submission. An equal command already waiting in
    /// the uncommitted suffix is reused: its term is refreshed to the
    /// current term and its index returned. Peers must then receive that
    /// entry again before it counts toward a commit.
    pub fn append_command(&mut self, command: Command) -> u64 {
        let term = self.persistent.current_term;
        let first_uncommitted = self.commit_index + 1;

        for index in first_uncommitted..=self.last_log_index() {
            let Some(entry) = self.persistent.log.get_mut(index) else {
                continue;
            };
            if entry.command != command {
                continue;
            }
            if entry.term != term {
                entry.term = term;
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.rewind(index);
                }
            }
            return index;
        }

        self.persistent.log.push(term, command)
    }
}
