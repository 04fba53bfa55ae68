use crate::api::RaftError;
use crate::commitlog::Log;
use crate::replica::{
    self, AppendEntriesInput, AppendEntriesOutput, ChangeMembershipInput, ChangeMembershipOutput, GroupMembersView,
    InstallSnapshotInput, LogEntry, PersistentLocalState, PreVoteInput, PreVoteOutput, RaftGroupId, RaftNodeReport,
    ReplicateInput, RequestVoteInput, RequestVoteOutput,
};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum Event {
    // Leader: Append to log, replicate, respond once applied.
    // Candidate/Follower: Redirect.
    Replicate(ReplicateInput, Callback<Vec<u8>>),
    ChangeMembership(ChangeMembershipInput, Callback<ChangeMembershipOutput>),
    TerminateGroup(Callback<()>),
    QueryMembers(Callback<GroupMembersView>),
    Report(Callback<RaftNodeReport>),

    // Any role: Grant if applicable. Never mutates local state.
    PreVote(PreVoteInput, Callback<PreVoteOutput>),

    // Any role: Grant vote if applicable. Transition to follower on higher term.
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput>),

    // Leader/Candidate: Transition to follower if applicable.
    // Follower: Reconcile log, advance commit index, reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput>),
    InstallSnapshot(InstallSnapshotInput, Callback<AppendEntriesOutput>),

    // Pre-candidate/Candidate: Count votes. Others: discard.
    PreVoteReplyFromPeer(replica::PreVoteReplyFromPeer),
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Update peer progress, advance commit index, complete client callbacks.
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Leader: Heartbeat one peer, or run housekeeping (check quorum, expiry proposals).
    LeaderTimer(replica::LeaderTimerTick),

    // Follower/Candidate: Start a pre-vote round.
    FollowerTimeout,

    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Replicate(input, _) => write!(f, "Replicate({} bytes)", input.op.len()),
            Event::ChangeMembership(input, _) => write!(f, "ChangeMembership({:?})", input),
            Event::TerminateGroup(_) => write!(f, "TerminateGroup"),
            Event::QueryMembers(_) => write!(f, "QueryMembers"),
            Event::Report(_) => write!(f, "Report"),
            Event::PreVote(input, _) => write!(f, "PreVote({:?})", input),
            Event::RequestVote(input, _) => write!(f, "RequestVote({:?})", input),
            Event::AppendEntries(input, _) => write!(
                f,
                "AppendEntries(term={:?}, prev={:?}, n={})",
                input.term,
                input.prev_log_index,
                input.entries.len()
            ),
            Event::InstallSnapshot(input, _) => write!(f, "InstallSnapshot({:?})", input.snapshot),
            Event::PreVoteReplyFromPeer(reply) => write!(f, "{:?}", reply),
            Event::RequestVoteReplyFromPeer(reply) => write!(f, "{:?}", reply),
            Event::AppendEntriesReplyFromPeer(reply) => write!(f, "{:?}", reply),
            Event::LeaderTimer(tick) => write!(f, "LeaderTimer({:?})", tick),
            Event::FollowerTimeout => write!(f, "FollowerTimeout"),
            Event::Shutdown => write!(f, "Shutdown"),
        }
    }
}

pub(crate) struct Callback<O>(oneshot::Sender<Result<O, RaftError>>);

impl<O> Callback<O> {
    pub(crate) fn send(self, message: Result<O, RaftError>) {
        let _ = self.0.send(message);
    }
}

#[cfg(test)]
impl<O> Callback<O> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<O, RaftError>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Raft replica event loop actor has exited")]
pub(crate) struct ActorExited;

/// ActorClient is the strong handle of a group's event loop. The loop runs until every
/// ActorClient is dropped or it receives `Event::Shutdown`.
#[derive(Clone)]
pub(crate) struct ActorClient {
    group_id: Arc<RaftGroupId>,
    sender: Arc<mpsc::Sender<Event>>,
}

/// WeakActorClient doesn't keep the event loop alive. Timers and in-flight RPC tasks hold this.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    group_id: Arc<RaftGroupId>,
    sender: Weak<mpsc::Sender<Event>>,
}

impl ActorClient {
    pub(crate) fn new(group_id: RaftGroupId, buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        let client = ActorClient {
            group_id: Arc::new(group_id),
            sender: Arc::new(tx),
        };

        (client, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            group_id: self.group_id.clone(),
            sender: Arc::downgrade(&self.sender),
        }
    }

    pub(crate) async fn replicate(&self, input: ReplicateInput) -> Result<Vec<u8>, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Replicate(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn change_membership(
        &self,
        input: ChangeMembershipInput,
    ) -> Result<ChangeMembershipOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ChangeMembership(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn terminate_group(&self) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::TerminateGroup(Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn query_members(&self) -> Result<GroupMembersView, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::QueryMembers(Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn report(&self) -> Result<RaftNodeReport, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Report(Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn pre_vote(&self, input: PreVoteInput) -> Result<PreVoteOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::PreVote(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<AppendEntriesOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx))).await?;
        self.await_callback(rx).await
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(Event::Shutdown).await;
    }

    // Undelivered: the event never reached the node, so redirecting elsewhere is safe.
    async fn send(&self, event: Event) -> Result<(), RaftError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| RaftError::not_leader(&self.group_id, None))
    }

    // Delivered, but the node went away before answering.
    async fn await_callback<O>(&self, rx: oneshot::Receiver<Result<O, RaftError>>) -> Result<O, RaftError> {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RaftError::IndeterminateOperationState(format!(
                "Raft node of group {:?} stopped before completing the request",
                self.group_id
            ))),
        }
    }
}

impl WeakActorClient {
    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn leader_timer(&self, tick: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn notify_pre_vote_reply_from_peer(
        &self,
        reply: replica::PreVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::PreVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) fn group_id(&self) -> &RaftGroupId {
        &self.group_id
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }
}

/// ReplicaActor is the raft node logic in actor model. Every mutation of a group's state is
/// serialized through its event loop.
pub(crate) struct ReplicaActor<L, S>
where
    L: Log<LogEntry>,
    S: PersistentLocalState,
{
    receiver: mpsc::Receiver<Event>,
    node: replica::RaftNode<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    pub(crate) fn new(receiver: mpsc::Receiver<Event>, node: replica::RaftNode<L, S>) -> Self {
        ReplicaActor { receiver, node }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Shutdown = event {
                self.node.shutdown();
                return;
            }
            self.handle_event(event);
        }
        self.node.shutdown();
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and come back as an event to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Replicate(input, callback) => self.node.handle_replicate(input, callback),
            Event::ChangeMembership(input, callback) => self.node.handle_change_membership(input, callback),
            Event::TerminateGroup(callback) => self.node.handle_terminate_group(callback),
            Event::QueryMembers(callback) => callback.send(self.node.handle_query_members()),
            Event::Report(callback) => callback.send(Ok(self.node.report())),
            Event::PreVote(input, callback) => callback.send(self.node.handle_pre_vote(input)),
            Event::RequestVote(input, callback) => callback.send(self.node.handle_request_vote(input)),
            Event::AppendEntries(input, callback) => callback.send(self.node.handle_append_entries(input)),
            Event::InstallSnapshot(input, callback) => callback.send(self.node.handle_install_snapshot(input)),
            Event::PreVoteReplyFromPeer(reply) => self.node.handle_pre_vote_reply_from_peer(reply),
            Event::RequestVoteReplyFromPeer(reply) => self.node.handle_request_vote_reply_from_peer(reply),
            Event::AppendEntriesReplyFromPeer(reply) => self.node.handle_append_entries_reply_from_peer(reply),
            Event::LeaderTimer(tick) => self.node.handle_leader_timer(tick),
            Event::FollowerTimeout => self.node.handle_follower_timeout(),
            Event::Shutdown => {}
        }
    }
}
