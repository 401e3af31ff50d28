//! RPC handler tests through the public API.
//!
//! Exercises the follower-side RequestVote/AppendEntries rules directly on
//! `RaftState`, and the node's inbound dispatcher and wire codec.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft_node::config::{NodeConfig, TimingConfig};
use raft_node::raft::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesArgs, AppendEntriesReply,
    RequestVoteArgs, RequestVoteReply,
};
use raft_node::raft::{ApplyMsg, LogEntry, RaftNode, RaftRole, RaftState, StateMachine};
use raft_node::transport::{
    decode_envelope, encode_envelope, Envelope, InboundHandler, LocalNetwork, Payload,
};

#[derive(Default)]
struct Recorder(Mutex<Vec<ApplyMsg>>);

impl StateMachine for Recorder {
    fn apply(&self, msg: ApplyMsg) {
        self.0.lock().unwrap().push(msg);
    }
}

impl Recorder {
    fn indices(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(|m| m.index).collect()
    }
}

fn state(node_id: u64) -> RaftState {
    RaftState::new(&NodeConfig::new(node_id, 0, 3))
}

fn vote(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> RequestVoteArgs {
    RequestVoteArgs {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    }
}

fn append(
    term: u64,
    leader_id: u64,
    prev: (u64, u64),
    entries: Vec<LogEntry>,
    leader_commit: u64,
) -> AppendEntriesArgs {
    AppendEntriesArgs {
        term,
        leader_id,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        leader_commit,
    }
}

fn node(node_id: u64) -> (RaftNode, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let network = LocalNetwork::new(Duration::from_millis(50));
    let config = NodeConfig::new(node_id, 0, 3).with_timing(TimingConfig::fast());
    let node = RaftNode::new(config, network, recorder.clone()).unwrap();
    (node, recorder)
}

#[test]
fn test_request_vote_grant_vote() {
    let mut state = state(1);
    let reply = handle_request_vote(&mut state, &vote(2, 2, 0, 0));

    assert!(reply.vote_granted);
    assert_eq!(reply.term, 2);
    assert_eq!(state.voted_for(), Some(2));
}

#[test]
fn test_request_vote_reject_stale_term() {
    let mut state = state(1);
    state.persistent.current_term = 5;

    let reply = handle_request_vote(&mut state, &vote(3, 2, 0, 0));
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, 5);
    assert_eq!(state.voted_for(), None);
}

#[test]
fn test_request_vote_reject_already_voted() {
    let mut state = state(1);
    state.persistent.current_term = 2;
    state.persistent.voted_for = Some(0);

    assert!(!handle_request_vote(&mut state, &vote(2, 2, 0, 0)).vote_granted);
    // The same candidate asking again is granted
    assert!(handle_request_vote(&mut state, &vote(2, 0, 0, 0)).vote_granted);
}

#[test]
fn test_request_vote_reject_outdated_log() {
    let mut state = state(1);
    state.persistent.current_term = 2;
    state.persistent.log.append(LogEntry::new(2, 1, b"a".to_vec())).unwrap();

    let reply = handle_request_vote(&mut state, &vote(3, 2, 0, 0));
    assert!(!reply.vote_granted);
    // The higher term was still adopted
    assert_eq!(reply.term, 3);
    assert_eq!(state.current_term(), 3);
}

#[test]
fn test_append_entries_stale_term() {
    let recorder = Recorder::default();
    let mut state = state(1);
    state.persistent.current_term = 4;

    let reply = handle_append_entries(&mut state, &append(3, 0, (0, 0), vec![], 0), &recorder);
    assert_eq!(
        reply,
        AppendEntriesReply {
            term: 4,
            success: false
        }
    );
    assert_eq!(state.leader_id, None);
}

#[test]
fn test_append_entries_adopts_first_leader_then_rejects_rival() {
    let recorder = Recorder::default();
    let mut state = state(1);
    state.persistent.current_term = 2;

    let reply = handle_append_entries(&mut state, &append(2, 0, (0, 0), vec![], 0), &recorder);
    assert!(reply.success);
    assert_eq!(state.leader_id, Some(0));

    let reply = handle_append_entries(&mut state, &append(2, 2, (0, 0), vec![], 0), &recorder);
    assert!(!reply.success);
    assert_eq!(state.leader_id, Some(0));
}

#[test]
fn test_append_entries_candidate_steps_down() {
    let recorder = Recorder::default();
    let mut state = state(1);
    state.become_candidate();

    let reply = handle_append_entries(&mut state, &append(1, 2, (0, 0), vec![], 0), &recorder);
    assert!(reply.success);
    assert_eq!(state.role, RaftRole::Follower);
    assert_eq!(state.leader_id, Some(2));
    assert_eq!(state.voted_for(), Some(1));
}

#[test]
fn test_follower_commit_applies_in_order() {
    let recorder = Recorder::default();
    let mut state = state(1);
    let entries = vec![
        LogEntry::new(1, 1, b"a".to_vec()),
        LogEntry::new(1, 2, b"b".to_vec()),
        LogEntry::new(1, 3, b"c".to_vec()),
    ];

    // Leader has committed further than it has shown this follower
    let first = append(1, 0, (0, 0), entries[..2].to_vec(), 3);
    let reply = handle_append_entries(&mut state, &first, &recorder);
    assert!(reply.success);
    assert_eq!(state.commit_index, 2);

    let second = append(1, 0, (2, 1), entries[2..].to_vec(), 3);
    let reply = handle_append_entries(&mut state, &second, &recorder);
    assert!(reply.success);
    assert_eq!(state.commit_index, 3);
    assert_eq!(state.last_applied, 3);
    assert_eq!(recorder.indices(), vec![1, 2, 3]);
}

#[test]
fn test_conflicting_suffix_truncated_above_commit_index() {
    let recorder = Recorder::default();
    let mut state = state(1);
    state.persistent.current_term = 1;
    for (index, term) in [(1, 1), (2, 1), (3, 2), (4, 2)] {
        state.persistent.log.append(LogEntry::new(term, index, vec![index as u8])).unwrap();
    }
    state.commit_index = 2;
    state.last_applied = 2;

    // Leader of term 3 holds term 3 at index 3
    let reply = handle_append_entries(&mut state, &append(3, 0, (3, 3), vec![], 2), &recorder);
    assert!(!reply.success);
    assert_eq!(state.last_log_index(), 3);

    // Backed off to index 2, which matches; the suffix is replaced
    let reply = handle_append_entries(
        &mut state,
        &append(3, 0, (2, 1), vec![LogEntry::new(3, 3, b"new".to_vec())], 2),
        &recorder,
    );
    assert!(reply.success);
    assert_eq!(state.last_log_index(), 3);
    assert_eq!(state.log().term_at(3), Some(3));
    assert_eq!(state.log().term_at(2), Some(1));
    assert!(recorder.indices().is_empty());
}

#[tokio::test]
async fn test_node_dispatches_vote_request() {
    let (node, _recorder) = node(1);
    let request = Envelope::new(0, 1, Payload::RequestVote(vote(1, 0, 0, 0)));

    let reply = node.deliver_inbound(request).await.unwrap();
    assert_eq!(
        reply,
        Envelope::new(
            1,
            0,
            Payload::RequestVoteReply(RequestVoteReply {
                term: 1,
                vote_granted: true
            })
        )
    );
    assert_eq!(node.status().await.voted_for, Some(0));
}

#[tokio::test]
async fn test_node_drops_reply_kinds_and_misaddressed() {
    let (node, _recorder) = node(1);

    let stray = Envelope::new(
        0,
        1,
        Payload::AppendEntriesReply(AppendEntriesReply {
            term: 1,
            success: true,
        }),
    );
    assert!(node.deliver_inbound(stray).await.is_none());

    let wrong_dest = Envelope::new(0, 2, Payload::RequestVote(vote(1, 0, 0, 0)));
    assert!(node.deliver_inbound(wrong_dest).await.is_none());
    assert_eq!(node.status().await.term, 0);
}

#[tokio::test]
async fn test_encoded_append_entries_round_trip() {
    let (node, recorder) = node(1);
    let request = Envelope::new(
        0,
        1,
        Payload::AppendEntries(append(1, 0, (0, 0), vec![LogEntry::new(1, 1, b"42".to_vec())], 1)),
    );

    let bytes = node
        .deliver_encoded(&encode_envelope(&request).unwrap())
        .await
        .unwrap();
    let reply = decode_envelope(&bytes).unwrap();
    assert_eq!(
        reply.payload,
        Payload::AppendEntriesReply(AppendEntriesReply {
            term: 1,
            success: true
        })
    );
    assert_eq!(recorder.indices(), vec![1]);
}

#[tokio::test]
async fn test_garbage_bytes_dropped() {
    let (node, _recorder) = node(1);
    assert!(node.deliver_encoded(b"\x00\x01garbage").await.is_none());
    assert!(node.deliver_encoded(b"{}").await.is_none());
}

#[tokio::test]
async fn test_commit_notification_on_follower_append_entries() {
    let (node, _recorder) = node(1);
    let mut commits = node.subscribe_commits();
    assert_eq!(*commits.borrow(), 0);

    let entries = vec![LogEntry::new(1, 1, b"a".to_vec()), LogEntry::new(1, 2, b"b".to_vec())];
    node.handle_append_entries(&append(1, 0, (0, 0), entries, 2)).await;

    tokio::time::timeout(Duration::from_secs(1), commits.changed())
        .await
        .expect("commit notification")
        .unwrap();
    assert_eq!(*commits.borrow_and_update(), 2);
}

#[tokio::test]
async fn test_no_notification_when_commit_index_unchanged() {
    let (node, _recorder) = node(1);
    let mut commits = node.subscribe_commits();

    node.handle_append_entries(&append(1, 0, (0, 0), vec![], 0)).await;

    assert!(!commits.has_changed().unwrap());
}
