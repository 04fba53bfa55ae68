use crate::actor::{ActorClient, Callback, Event};
use crate::api::{RaftError, RaftOptions, RaftOptionsValidated};
use crate::commitlog::{InMemoryLog, Index, Log};
use crate::replica::local_state::{PersistentLocalState, Term, VolatileLocalState};
use crate::replica::log_entry::{LogEntry, RaftOp};
use crate::replica::raft_node::node::{RaftNode, RaftNodeConfig};
use crate::replica::replica_api::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor,
    LeaderTimerTick, PreVoteOutput, PreVoteReplyFromPeer, ReplicateInput, RequestVoteOutput, RequestVoteReplyFromPeer,
};
use crate::replica::state_machine::{ApplyContext, OpOutcome, StateMachine};
use crate::replica::{ElectionStateChangeListener, RaftEndpoint, RaftGroupId, ReplicaId};
use crate::transport::{InvocationRequest, InvocationResponse, RaftRequest, RaftResponse, RaftTransport, TransportError};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub(super) type TestRaftNode = RaftNode<InMemoryLog<LogEntry>, VolatileLocalState>;

pub(super) fn endpoint(i: usize) -> RaftEndpoint {
    RaftEndpoint::new(format!("m{}", i), format!("127.0.0.1:{}", 7100 + i))
}

pub(super) fn entry(term: u64, index: u64) -> LogEntry {
    LogEntry {
        term: Term::new(term),
        index: Index::new(index),
        timestamp_millis: 0,
        op: RaftOp::Service(vec![index as u8]),
    }
}

/// Fails every call, so each request the node sends comes straight back to the test as an
/// event carrying its reply descriptor.
struct UnreachableTransport;

#[async_trait::async_trait]
impl RaftTransport for UnreachableTransport {
    async fn send_raft(&self, target: &RaftEndpoint, _request: RaftRequest) -> Result<RaftResponse, TransportError> {
        Err(TransportError::Unreachable(format!("{:?}", target.id)))
    }

    async fn invoke(
        &self,
        target: &RaftEndpoint,
        _request: InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        Err(TransportError::Unreachable(format!("{:?}", target.id)))
    }
}

/// Applies every op by echoing it back, and records what it applied and restored.
#[derive(Default)]
struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<Vec<u8>>>>,
    restored: Arc<Mutex<Vec<Index>>>,
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, _ctx: &mut ApplyContext, op: &[u8]) -> OpOutcome {
        self.applied.lock().unwrap().push(op.to_vec());
        OpOutcome::Applied(op.to_vec())
    }

    fn take_snapshot(&self, _group_id: &RaftGroupId, _commit_index: Index) -> Result<Vec<u8>, RaftError> {
        Ok(Vec::new())
    }

    fn restore_snapshot(
        &mut self,
        _group_id: &RaftGroupId,
        commit_index: Index,
        _snapshot: &[u8],
    ) -> Result<(), RaftError> {
        self.restored.lock().unwrap().push(commit_index);
        Ok(())
    }
}

/// TestNode drives member `m1` of a group by calling the node's handlers directly, playing the
/// part of its event loop and of every peer.
pub(super) struct TestNode {
    pub(super) node: TestRaftNode,
    rx: mpsc::Receiver<Event>,
    // Latest AppendEntries sent to each peer and not answered yet.
    outstanding: HashMap<ReplicaId, AppendEntriesReplyFromPeerDescriptor>,
    applied: Arc<Mutex<Vec<Vec<u8>>>>,
    restored: Arc<Mutex<Vec<Index>>>,
    _actor_client: ActorClient,
    _listener: ElectionStateChangeListener,
}

impl TestNode {
    /// `log_terms` seeds the log with one entry per term, from index 1. The local term starts at
    /// the last of them.
    pub(super) fn new(member_count: usize, log_terms: &[u64], options: RaftOptions) -> Self {
        let group_id = RaftGroupId::new("node-test", 0);
        let members: Vec<RaftEndpoint> = (1..=member_count).map(endpoint).collect();

        let mut log = InMemoryLog::create().unwrap();
        for (i, term) in log_terms.iter().enumerate() {
            log.append(entry(*term, i as u64 + 1)).unwrap();
        }
        let mut local_state = VolatileLocalState::new(members[0].id.clone());
        if let Some(term) = log_terms.last() {
            local_state.store_term_if_increased(Term::new(*term));
        }

        // Timers are slow enough to stay out of the way. Their events are never handled.
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_secs(1)),
            follower_min_timeout: Some(Duration::from_secs(5)),
            follower_max_timeout: Some(Duration::from_secs(10)),
            leader_append_entries_timeout: Some(Duration::from_secs(1)),
            housekeeping_interval: Some(Duration::from_secs(1)),
            ..options
        };
        let state_machine = RecordingStateMachine::default();
        let applied = state_machine.applied.clone();
        let restored = state_machine.restored.clone();
        let (actor_client, rx) = ActorClient::new(group_id.clone(), 1024);
        let (node, listener) = RaftNode::new(RaftNodeConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            group_id,
            local: members[0].clone(),
            initial_members: members,
            log,
            local_state,
            state_machine: Box::new(state_machine),
            transport: Arc::new(UnreachableTransport),
            actor_client: actor_client.weak(),
            options: RaftOptionsValidated::try_from(options).unwrap(),
        })
        .unwrap();

        TestNode {
            node,
            rx,
            outstanding: HashMap::new(),
            applied,
            restored,
            _actor_client: actor_client,
            _listener: listener,
        }
    }

    /// Wins a pre-vote and a vote with every peer granting.
    pub(super) fn elect(&mut self) {
        self.node.handle_follower_timeout();
        let current_term = self.node.state.term();
        let peers: Vec<ReplicaId> = self.node.state.remote_members().into_iter().map(|m| m.id).collect();

        for peer_id in peers.iter() {
            self.node.handle_pre_vote_reply_from_peer(PreVoteReplyFromPeer {
                peer_id: peer_id.clone(),
                next_term: current_term.next(),
                result: Ok(PreVoteOutput {
                    term: current_term,
                    vote_granted: true,
                }),
            });
        }
        let term = self.node.state.term();
        for peer_id in peers.iter() {
            self.node.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                peer_id: peer_id.clone(),
                term,
                result: Ok(RequestVoteOutput {
                    term,
                    vote_granted: true,
                }),
            });
        }
        assert!(self.node.state.election().is_leader());
    }

    pub(super) fn replicate(&mut self, op: Vec<u8>) -> oneshot::Receiver<Result<Vec<u8>, RaftError>> {
        let (callback, rx) = Callback::new();
        self.node.handle_replicate(ReplicateInput { op }, callback);
        rx
    }

    pub(super) fn heartbeat(&mut self, peer: usize) {
        let term = self.node.state.term();
        self.node.handle_leader_timer(LeaderTimerTick::Heartbeat {
            peer_id: endpoint(peer).id,
            term,
        });
    }

    /// Answers the AppendEntries outstanding to `peer` with a success up to `last_log_index`.
    pub(super) async fn ack(&mut self, peer: usize, last_log_index: u64) {
        self.collect_sent_requests().await;
        let peer_id = endpoint(peer).id;
        let descriptor = self
            .outstanding
            .remove(&peer_id)
            .unwrap_or_else(|| panic!("No AppendEntries outstanding to {:?}", peer_id));
        let term = self.node.state.term();

        self.node.handle_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor,
            result: Ok(AppendEntriesOutput::Success {
                term,
                last_log_index: Index::new(last_log_index),
            }),
        });
    }

    async fn collect_sent_requests(&mut self) {
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await {
            if let Event::AppendEntriesReplyFromPeer(reply) = event {
                self.outstanding
                    .insert(reply.descriptor.peer_id.clone(), reply.descriptor);
            }
        }
    }

    /// AppendEntries from leader `m2`.
    pub(super) fn append_from_leader(
        &mut self,
        term: u64,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        leader_commit_index: u64,
    ) -> AppendEntriesOutput {
        let (prev_log_term, prev_log_index) = prev;
        self.node
            .handle_append_entries(AppendEntriesInput {
                leader: endpoint(2),
                term: Term::new(term),
                prev_log_index: Index::new(prev_log_index),
                prev_log_term: Term::new(prev_log_term),
                leader_commit_index: Index::new(leader_commit_index),
                entries,
            })
            .unwrap()
    }

    pub(super) fn commit_index(&self) -> u64 {
        self.node.state.commit_index().as_u64()
    }

    pub(super) fn last_log_index(&self) -> u64 {
        self.node.state.log().last_log_or_snapshot_index().as_u64()
    }

    pub(super) fn term_at(&self, index: u64) -> Option<u64> {
        self.node
            .state
            .log()
            .term_at(Index::new(index))
            .unwrap()
            .map(|term| term.as_u64())
    }

    pub(super) fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().unwrap().clone()
    }

    pub(super) fn restored(&self) -> Vec<Index> {
        self.restored.lock().unwrap().clone()
    }
}
