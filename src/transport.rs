//! Message envelopes, the transport seam, and an in-process network.
//!
//! The core only depends on [`Transport`] (outbound calls that either return
//! a reply or fail) and [`InboundHandler`] (the node's dispatcher).
//! [`LocalNetwork`] connects nodes inside one process and can partition,
//! crash, and drop messages, which is what the integration tests and the demo
//! binary run on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{RaftError, Result};
use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}

impl Payload {
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Payload::RequestVoteReply(_) | Payload::AppendEntriesReply(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::RequestVote(_) => "RequestVote",
            Payload::RequestVoteReply(_) => "RequestVoteReply",
            Payload::AppendEntries(_) => "AppendEntries",
            Payload::AppendEntriesReply(_) => "AppendEntriesReply",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(src: NodeId, dest: NodeId, payload: Payload) -> Self {
        Self { src, dest, payload }
    }

    /// Reply travelling back to the sender of `self`.
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dest,
            dest: self.src,
            payload,
        }
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| RaftError::Malformed(e.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(|e| RaftError::Malformed(e.to_string()))
}

/// Outbound RPC. Any failure (unreachable peer, timeout, dropped message)
/// surfaces as [`RaftError::NoReply`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<Envelope>;
}

/// Receives requests addressed to a node and produces its reply, if any.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn deliver_inbound(&self, envelope: Envelope) -> Option<Envelope>;
}

/// In-memory network joining the nodes of one process.
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<dyn InboundHandler>>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
    loss_rate: RwLock<f64>,
    rpc_timeout: Duration,
}

impl LocalNetwork {
    pub fn new(rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            loss_rate: RwLock::new(0.0),
            rpc_timeout,
        })
    }

    pub async fn register(&self, node_id: NodeId, handler: Arc<dyn InboundHandler>) {
        self.nodes.write().await.insert(node_id, handler);
    }

    /// Remove a node; messages to it get no reply (simulates a crash).
    pub async fn remove(&self, node_id: NodeId) -> bool {
        self.nodes.write().await.remove(&node_id).is_some()
    }

    pub async fn clear(&self) {
        self.nodes.write().await.clear();
    }

    /// Cut the link between `a` and `b` in both directions.
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().await;
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    pub async fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().await;
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    pub async fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.disconnect(a, b).await;
            }
        }
    }

    /// Cut `node_id` off from every other registered node.
    pub async fn isolate(&self, node_id: NodeId) {
        let others: Vec<NodeId> = self
            .nodes
            .read()
            .await
            .keys()
            .copied()
            .filter(|&id| id != node_id)
            .collect();
        self.partition(&[node_id], &others).await;
    }

    /// Restore every link cut by `disconnect`, `partition` or `isolate`.
    pub async fn heal(&self) {
        self.blocked.write().await.clear();
    }

    /// Probability in `[0, 1]` that any single message is dropped.
    pub async fn set_loss_rate(&self, rate: f64) {
        *self.loss_rate.write().await = rate.clamp(0.0, 1.0);
    }

    async fn drops_message(&self) -> bool {
        let rate = *self.loss_rate.read().await;
        if rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(rate)
    }

    async fn is_blocked(&self, src: NodeId, dest: NodeId) -> bool {
        self.blocked.read().await.contains(&(src, dest))
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> Result<Envelope> {
        let src = envelope.src;
        let dest = envelope.dest;
        let no_reply = RaftError::NoReply { peer: dest };

        if self.is_blocked(src, dest).await || self.drops_message().await {
            return Err(no_reply);
        }

        let handler = match self.nodes.read().await.get(&dest) {
            Some(handler) => handler.clone(),
            None => return Err(no_reply),
        };

        let reply = match tokio::time::timeout(self.rpc_timeout, handler.deliver_inbound(envelope))
            .await
        {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(no_reply),
            Err(_) => {
                tracing::trace!(src, dest, "RPC timed out");
                return Err(no_reply);
            }
        };

        // Replies cross the same link in the opposite direction
        if self.is_blocked(dest, src).await || self.drops_message().await {
            return Err(no_reply);
        }
        Ok(reply)
    }
}
