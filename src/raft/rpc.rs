use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::raft::commit::StateMachine;
use crate::raft::log::LogEntry;
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries; an empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &RequestVoteArgs) -> RequestVoteReply {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term() {
        state.become_follower(req.term, None);
    }

    let vote_granted = if req.term < state.current_term() {
        false
    } else if state
        .voted_for()
        .is_some_and(|voted| voted != req.candidate_id)
    {
        // Already voted for someone else in this term
        false
    } else {
        state.is_log_up_to_date(req.last_log_index, req.last_log_term)
    };

    if vote_granted {
        state.persistent.voted_for = Some(req.candidate_id);
        state.deadlines.reset_election();
    }

    tracing::debug!(
        node_id = state.node_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    RequestVoteReply {
        term: state.current_term(),
        vote_granted,
    }
}

/// Handle AppendEntries RPC. Runs as one atomic step under the node lock.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesArgs,
    state_machine: &dyn StateMachine,
) -> AppendEntriesReply {
    match apply_append_entries(state, req, state_machine) {
        Ok(()) => AppendEntriesReply {
            term: state.current_term(),
            success: true,
        },
        Err(reason) => {
            tracing::debug!(
                node_id = state.node_id,
                leader_id = req.leader_id,
                term = req.term,
                %reason,
                "Rejected AppendEntries"
            );
            AppendEntriesReply {
                term: state.current_term(),
                success: false,
            }
        }
    }
}

fn apply_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesArgs,
    state_machine: &dyn StateMachine,
) -> Result<(), RaftError> {
    let current = state.current_term();
    if req.term < current {
        return Err(RaftError::StaleTerm {
            term: req.term,
            current,
        });
    }

    if req.term > current || (state.role == RaftRole::Candidate && req.term == current) {
        state.become_follower(req.term, Some(req.leader_id));
    }

    // Only one leader exists per term, so the first one heard from is adopted
    if state.role == RaftRole::Follower && state.leader_id.is_none() {
        state.leader_id = Some(req.leader_id);
    }
    if state.leader_id != Some(req.leader_id) {
        return Err(RaftError::NotMyLeader {
            leader_id: req.leader_id,
            recognized: state.leader_id,
        });
    }
    state.deadlines.reset_election();

    let consistent = state.last_log_index() >= req.prev_log_index
        && (req.prev_log_index == 0
            || state.log().term_at(req.prev_log_index) == Some(req.prev_log_term));

    if !consistent {
        // Never touch committed entries
        if req.prev_log_index >= state.commit_index {
            state
                .persistent
                .log
                .delete_conflicting_entries(req.prev_log_index + 1);
        }
        return Err(RaftError::LogInconsistency {
            index: req.prev_log_index,
        });
    }

    for entry in &req.entries {
        match state.log().term_at(entry.index) {
            Some(term) if term == entry.term => continue,
            Some(_) => {
                if entry.index <= state.commit_index {
                    return Err(RaftError::LogInconsistency { index: entry.index });
                }
                state.persistent.log.delete_conflicting_entries(entry.index);
            }
            None => {}
        }
        state.persistent.log.append(entry.clone())?;
    }

    if !req.entries.is_empty() {
        tracing::debug!(
            node_id = state.node_id,
            entries_appended = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    let last_new_index = req.prev_log_index + req.entries.len() as u64;
    let new_commit_index = req.leader_commit.min(last_new_index);
    if new_commit_index > state.commit_index {
        let old = state.commit_index;
        state.apply_till_new_commit_index(old, new_commit_index, state_machine);
    }

    Ok(())
}
