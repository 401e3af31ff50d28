pub mod commit;
pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod tracker;

/// Cluster member identifier, `0..num_peers`.
pub type NodeId = u64;

pub use commit::{ApplyMsg, StateMachine};
pub use log::{Command, Log, LogEntry};
pub use node::{NodeStatus, RaftNode, StartReply};
pub use state::{PersistentState, RaftRole, RaftState};
pub use tracker::ReplicationTracker;
