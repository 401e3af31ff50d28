use thiserror::Error;

use crate::raft::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("Stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },

    #[error("Node {leader_id} is not the recognized leader {recognized:?}")]
    NotMyLeader {
        leader_id: NodeId,
        recognized: Option<NodeId>,
    },

    #[error("Log inconsistency at index {index}")]
    LogInconsistency { index: u64 },

    #[error("No reply from peer {peer}")]
    NoReply { peer: NodeId },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
