pub mod config;
pub mod error;
pub mod raft;
pub mod shutdown;
pub mod transport;

pub use config::{NodeConfig, TimingConfig};
pub use error::{RaftError, Result};
pub use raft::{ApplyMsg, NodeStatus, RaftNode, RaftRole, StartReply, StateMachine};
pub use transport::{Envelope, InboundHandler, LocalNetwork, Payload, Transport};
