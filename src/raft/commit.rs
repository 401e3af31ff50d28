use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::raft::log::Command;
use crate::raft::state::RaftState;
use crate::raft::NodeId;

/// A committed command delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMsg {
    pub node_id: NodeId,
    pub index: u64,
    pub command: Command,
}

/// Application state machine fed with committed entries.
///
/// Called exactly once per committed index, in increasing index order,
/// never concurrently for the same node.
pub trait StateMachine: Send + Sync {
    fn apply(&self, msg: ApplyMsg);
}

impl StateMachine for mpsc::UnboundedSender<ApplyMsg> {
    fn apply(&self, msg: ApplyMsg) {
        if self.send(msg).is_err() {
            tracing::trace!("Apply channel closed, dropping committed entry");
        }
    }
}

impl RaftState {
    /// Deliver entries `old + 1 ..= new` to the state machine, then move
    /// `commit_index` and `last_applied` to `new`.
    pub fn apply_till_new_commit_index(
        &mut self,
        old_commit_index: u64,
        new_commit_index: u64,
        state_machine: &dyn StateMachine,
    ) {
        if new_commit_index <= self.commit_index {
            return;
        }

        for index in (old_commit_index + 1)..=new_commit_index {
            let Some(entry) = self.persistent.log.get(index) else {
                tracing::warn!(
                    node_id = self.node_id,
                    index,
                    "Commit index beyond log tail"
                );
                break;
            };
            state_machine.apply(ApplyMsg {
                node_id: self.node_id,
                index,
                command: entry.command.clone(),
            });
            self.commit_index = index;
            self.last_applied = index;
        }

        tracing::debug!(
            node_id = self.node_id,
            commit_index = self.commit_index,
            "Updated commit index"
        );
    }

    /// Leader commit rule: advance to the highest index held by a strict
    /// majority, but only when that entry is from the current term.
    /// Returns whether `commit_index` moved.
    pub fn commit_entry(&mut self, state_machine: &dyn StateMachine) -> bool {
        if !self.is_leader() {
            return false;
        }
        let Some(tracker) = self.tracker.as_ref() else {
            return false;
        };

        let new_commit_index =
            tracker.majority_match_index(self.last_log_index(), self.cluster_size);

        if new_commit_index <= self.commit_index {
            return false;
        }
        if self.log().term_at(new_commit_index) != Some(self.current_term()) {
            tracing::trace!(
                node_id = self.node_id,
                index = new_commit_index,
                "Majority index not from current term, not committing"
            );
            return false;
        }

        let old = self.commit_index;
        self.apply_till_new_commit_index(old, new_commit_index, state_machine);
        true
    }
}
