use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::commit::StateMachine;
use crate::raft::log::{Command, LogEntry};
use crate::raft::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesArgs, AppendEntriesReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::tracker::Backoff;
use crate::raft::NodeId;
use crate::transport::{
    decode_envelope, encode_envelope, Envelope, InboundHandler, Payload, Transport,
};

/// Outcome of [`RaftNode::start`]. `index` is `None` when this node is not
/// the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReply {
    pub index: Option<u64>,
    pub term: u64,
    pub is_leader: bool,
}

/// Point-in-time view of a node, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub voted_for: Option<NodeId>,
}

/// A single Raft replica.
///
/// All protocol state sits behind one mutex. Outbound RPCs are made with the
/// lock released: parameters are snapshotted under the lock, the call runs
/// unlocked, and the reply is applied after re-locking and re-checking role
/// and term.
#[derive(Clone)]
pub struct RaftNode {
    pub id: NodeId,
    config: Arc<NodeConfig>,
    state: Arc<Mutex<RaftState>>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    commit_tx: Arc<watch::Sender<u64>>,
    wake: Arc<Notify>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;
        let (commit_tx, _) = watch::channel(0);
        Ok(Self {
            id: config.node_id,
            state: Arc::new(Mutex::new(RaftState::new(&config))),
            config: Arc::new(config),
            transport,
            state_machine,
            commit_tx: Arc::new(commit_tx),
            wake: Arc::new(Notify::new()),
        })
    }

    /// Receiver that observes every advance of the commit index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    fn publish_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    /// Submit a command. Only a leader accepts it; the entry is replicated
    /// by the following heartbeat rounds.
    pub async fn start(&self, command: impl Into<Command>) -> StartReply {
        let mut state = self.state.lock().await;
        let term = state.current_term();
        if !state.is_leader() {
            return StartReply {
                index: None,
                term,
                is_leader: false,
            };
        }

        let index = state.append_command(command.into());
        tracing::debug!(node_id = self.id, term, index, "Accepted command");
        StartReply {
            index: Some(index),
            term,
            is_leader: true,
        }
    }

    /// Like [`start`](Self::start), but reports the known leader on refusal.
    pub async fn propose(&self, command: impl Into<Command>) -> Result<u64> {
        let reply = self.start(command).await;
        match reply.index {
            Some(index) => Ok(index),
            None => Err(RaftError::NotLeader(self.state.lock().await.leader_id)),
        }
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term(), state.is_leader())
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            node_id: self.id,
            role: state.role,
            term: state.current_term(),
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            voted_for: state.voted_for(),
        }
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().await.log().entries().to_vec()
    }

    pub async fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let reply = {
            let mut state = self.state.lock().await;
            handle_request_vote(&mut state, args)
        };
        self.wake.notify_one();
        reply
    }

    pub async fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let (reply, commit_index) = {
            let mut state = self.state.lock().await;
            let reply = handle_append_entries(&mut state, args, self.state_machine.as_ref());
            (reply, state.commit_index)
        };
        self.publish_commit(commit_index);
        self.wake.notify_one();
        reply
    }

    /// Decode a wire message, dispatch it, and encode the reply. Undecodable
    /// input is dropped.
    pub async fn deliver_encoded(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let envelope = match decode_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(node_id = self.id, error = %e, "Dropping undecodable message");
                return None;
            }
        };
        let reply = self.deliver_inbound(envelope).await?;
        match encode_envelope(&reply) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Failed to encode reply");
                None
            }
        }
    }

    async fn call_request_vote(
        &self,
        peer_id: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply> {
        let envelope = Envelope::new(self.id, peer_id, Payload::RequestVote(args));
        match self.transport.send(envelope).await?.payload {
            Payload::RequestVoteReply(reply) => Ok(reply),
            other => Err(RaftError::Malformed(format!(
                "expected RequestVoteReply, got {}",
                other.kind()
            ))),
        }
    }

    async fn call_append_entries(
        &self,
        peer_id: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let envelope = Envelope::new(self.id, peer_id, Payload::AppendEntries(args));
        match self.transport.send(envelope).await?.payload {
            Payload::AppendEntriesReply(reply) => Ok(reply),
            other => Err(RaftError::Malformed(format!(
                "expected AppendEntriesReply, got {}",
                other.kind()
            ))),
        }
    }

    /// Run one election round. Only a follower campaigns; the round ends as
    /// leader, back as follower in the same term, or stepped down to a
    /// higher term.
    pub async fn start_election(&self) {
        let (term, args) = {
            let mut state = self.state.lock().await;
            if state.role != RaftRole::Follower {
                return;
            }
            state.become_candidate();
            let term = state.current_term();
            tracing::info!(node_id = self.id, term, "Starting election");

            if state.has_majority(1) {
                state.become_leader();
                tracing::info!(node_id = self.id, term, "Became leader");
                drop(state);
                self.wake.notify_one();
                self.heartbeat_round().await;
                return;
            }

            let args = RequestVoteArgs {
                term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            };
            (term, args)
        };

        let mut requests = JoinSet::new();
        for peer_id in self.config.peer_ids() {
            let node = self.clone();
            let args = args.clone();
            requests.spawn(async move { (peer_id, node.call_request_vote(peer_id, args).await) });
        }

        let mut votes = 1usize;
        while let Some(joined) = requests.join_next().await {
            let (peer_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(node_id = self.id, error = %e, "Vote request task failed");
                    continue;
                }
            };
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::trace!(node_id = self.id, peer_id, error = %e, "No vote reply");
                    continue;
                }
            };

            let mut state = self.state.lock().await;
            if reply.term > state.current_term() {
                state.become_follower(reply.term, None);
                drop(state);
                self.wake.notify_one();
                return;
            }
            if state.role != RaftRole::Candidate || state.current_term() != term {
                // Superseded by an inbound RPC while votes were in flight
                return;
            }
            if !reply.vote_granted {
                continue;
            }

            votes += 1;
            tracing::debug!(node_id = self.id, peer_id, term, votes, "Received vote");
            if state.has_majority(votes) {
                state.become_leader();
                tracing::info!(node_id = self.id, term, votes, "Became leader");
                drop(state);
                requests.abort_all();
                self.wake.notify_one();
                self.heartbeat_round().await;
                return;
            }
        }

        let mut state = self.state.lock().await;
        if state.role == RaftRole::Candidate && state.current_term() == term {
            tracing::debug!(
                node_id = self.id,
                term,
                votes,
                "Election failed, reverting to follower"
            );
            state.revert_to_follower();
        }
    }

    /// Bring one peer up to date, backing off `next_index` on rejection.
    /// Retries only while this node is still leader of `term`. Returns
    /// whether the peer acknowledged.
    async fn send_append_entries(&self, peer_id: NodeId, term: u64) -> bool {
        loop {
            let (args, leader_last, generation) = {
                let state = self.state.lock().await;
                if !state.is_leader() || state.current_term() != term {
                    return false;
                }
                let Some(tracker) = state.tracker.as_ref() else {
                    return false;
                };
                let next_index = tracker.next_index(peer_id);
                let prev_log_index = next_index.saturating_sub(1);
                let args = AppendEntriesArgs {
                    term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term: state.log().term_at(prev_log_index).unwrap_or(1),
                    entries: state.log().entries_from(next_index),
                    leader_commit: state.commit_index,
                };
                (args, state.last_log_index(), tracker.generation())
            };
            let prev_log_index = args.prev_log_index;
            let sent = args.entries.len() as u64;

            let reply = match self.call_append_entries(peer_id, args).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::trace!(
                        node_id = self.id,
                        peer_id,
                        error = %e,
                        "No AppendEntries reply"
                    );
                    return false;
                }
            };

            let mut state = self.state.lock().await;
            if reply.term > state.current_term() {
                state.become_follower(reply.term, None);
                drop(state);
                self.wake.notify_one();
                return false;
            }
            if !state.is_leader() || state.current_term() != term {
                return false;
            }
            let current_last = state.last_log_index();
            let Some(tracker) = state.tracker.as_mut() else {
                return false;
            };
            if tracker.generation() != generation {
                // Log rewritten while the request was out; its reply says
                // nothing about the entries we hold now
                continue;
            }

            if reply.success {
                if sent == 0 {
                    tracker.record_heartbeat(peer_id, prev_log_index, leader_last);
                } else {
                    tracker.record_success(peer_id, prev_log_index + sent);
                    tracing::debug!(
                        node_id = self.id,
                        peer_id,
                        match_index = prev_log_index + sent,
                        "Replicated entries"
                    );
                }
                return true;
            }

            match tracker.back_off(peer_id, current_last) {
                Backoff::Retry => {
                    tracing::debug!(
                        node_id = self.id,
                        peer_id,
                        next_index = tracker.next_index(peer_id),
                        "AppendEntries rejected, backing off"
                    );
                }
                Backoff::GiveUp => return false,
            }
        }
    }

    /// One peer's share of a heartbeat round. An acknowledgement may be the
    /// one that completes a majority, so the commit rule runs right after
    /// it; an advance makes the next heartbeat due at once.
    async fn replicate_to(&self, peer_id: NodeId, term: u64) {
        let acked = self.send_append_entries(peer_id, term).await;

        let mut state = self.state.lock().await;
        state.replicating.remove(&peer_id);
        if !acked || !state.is_leader() || state.current_term() != term {
            return;
        }
        if !state.commit_entry(self.state_machine.as_ref()) {
            return;
        }
        let commit_index = state.commit_index;
        state.deadlines.expire_heartbeat();
        drop(state);

        tracing::trace!(node_id = self.id, peer_id, term, commit_index, "Commit advanced");
        self.publish_commit(commit_index);
        self.wake.notify_one();
    }

    /// One leader round: advance the commit index, then start replication
    /// to every peer without waiting for any of them. A peer still busy
    /// with the previous round is skipped, so a slow peer never delays the
    /// others.
    pub async fn heartbeat_round(&self) {
        let (term, peers, advanced, commit_index) = {
            let mut state = self.state.lock().await;
            if !state.is_leader() {
                return;
            }
            state.deadlines.reset_heartbeat();
            let advanced = state.commit_entry(self.state_machine.as_ref());
            let peers: Vec<NodeId> = self
                .config
                .peer_ids()
                .into_iter()
                .filter(|&peer_id| state.replicating.insert(peer_id))
                .collect();
            (state.current_term(), peers, advanced, state.commit_index)
        };

        if advanced {
            self.publish_commit(commit_index);
        }
        tracing::trace!(
            node_id = self.id,
            term,
            peers = peers.len(),
            commit_index,
            "Heartbeat round"
        );

        for peer_id in peers {
            let node = self.clone();
            tokio::spawn(async move { node.replicate_to(peer_id, term).await });
        }
    }

    /// Drive elections and heartbeats until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(node_id = self.id, "Raft scheduler started");
        loop {
            let (role, election_deadline, heartbeat_deadline) = {
                let state = self.state.lock().await;
                (state.role, state.deadlines.election, state.deadlines.heartbeat)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(node_id = self.id, "Raft scheduler stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(election_deadline), if role == RaftRole::Follower => {
                    let expired = {
                        let state = self.state.lock().await;
                        state.role == RaftRole::Follower && state.deadlines.election_expired()
                    };
                    if expired {
                        tracing::debug!(node_id = self.id, "Election timeout");
                        self.start_election().await;
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_deadline), if role == RaftRole::Leader => {
                    let expired = {
                        let state = self.state.lock().await;
                        state.is_leader() && state.deadlines.heartbeat_expired()
                    };
                    if expired {
                        self.heartbeat_round().await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler for RaftNode {
    async fn deliver_inbound(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.dest != self.id {
            tracing::debug!(
                node_id = self.id,
                dest = envelope.dest,
                "Dropping misaddressed message"
            );
            return None;
        }

        if envelope.payload.is_reply() {
            tracing::debug!(
                node_id = self.id,
                kind = envelope.payload.kind(),
                "Dropping unsolicited reply"
            );
            return None;
        }

        let payload = match &envelope.payload {
            Payload::RequestVote(args) => {
                Payload::RequestVoteReply(self.handle_request_vote(args).await)
            }
            Payload::AppendEntries(args) => {
                Payload::AppendEntriesReply(self.handle_append_entries(args).await)
            }
            Payload::RequestVoteReply(_) | Payload::AppendEntriesReply(_) => return None,
        };
        Some(envelope.reply(payload))
    }
}
