use crate::api::RaftError;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::log_entry::{LogEntry, SnapshotEntry};
use crate::replica::members::{MembershipChangeMode, RaftEndpoint, RaftGroupId, RaftGroupMembers, ReplicaId};
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};

// ------- Member-to-member RPCs -------

/// PreVoteInput asks whether the receiver would vote for the candidate in `next_term`, without
/// the receiver changing any state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteInput {
    pub candidate: RaftEndpoint,
    pub next_term: Term,
    pub last_log_term: Term,
    pub last_log_index: Index,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteOutput {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteInput {
    pub candidate: RaftEndpoint,
    pub term: Term,
    pub last_log_term: Term,
    pub last_log_index: Index,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteOutput {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesInput {
    pub leader: RaftEndpoint,
    pub term: Term,
    // "Previous log entry" is the log entry immediately preceding the new ones.
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub leader_commit_index: Index,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendEntriesOutput {
    Success { term: Term, last_log_index: Index },
    Failure { term: Term, expected_next_index: Index },
}

impl AppendEntriesOutput {
    pub fn term(&self) -> Term {
        match self {
            AppendEntriesOutput::Success { term, .. } => *term,
            AppendEntriesOutput::Failure { term, .. } => *term,
        }
    }
}

/// InstallSnapshotInput ships the leader's whole snapshot in one message. Replies reuse
/// `AppendEntriesOutput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotInput {
    pub leader: RaftEndpoint,
    pub term: Term,
    pub snapshot: SnapshotEntry,
}

// ------- Client-facing operations -------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateInput {
    pub op: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMembershipInput {
    pub member: RaftEndpoint,
    pub mode: MembershipChangeMode,
    /// Commit index of the membership the caller expects to change.
    pub expected_members_commit_index: Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMembershipOutput {
    pub members_commit_index: Index,
    pub members: Vec<RaftEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembersView {
    pub term: Term,
    pub leader: RaftEndpoint,
    pub members: RaftGroupMembers,
}

// ------- Status -------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

/// Lifecycle of the local node within its group, layered on top of its role.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftNodeStatus {
    Active,
    ChangingMembership,
    Terminating,
    Terminated,
    SteppedDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftNodeReport {
    pub group_id: RaftGroupId,
    pub local: RaftEndpoint,
    pub role: RaftRole,
    pub status: RaftNodeStatus,
    pub term: Term,
    pub leader: Option<RaftEndpoint>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
    pub last_log_term: Term,
    pub snapshot_index: Index,
    pub committed_members: RaftGroupMembers,
    pub last_members: RaftGroupMembers,
}

// ------- Replies from peers, delivered back into the actor -------

#[derive(Debug)]
pub(crate) enum PeerReplyError {
    Transport(TransportError),
    Rejected(RaftError),
    Malformed,
}

#[derive(Debug)]
pub(crate) struct PreVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) next_term: Term,
    pub(crate) result: Result<PreVoteOutput, PeerReplyError>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteOutput, PeerReplyError>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<AppendEntriesOutput, PeerReplyError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) snapshot_index: Option<Index>,
}

/// LeaderTimerTick contains info for a single tick of one of a leader's timers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LeaderTimerTick {
    Heartbeat { peer_id: ReplicaId, term: Term },
    Housekeeping { term: Term },
}

impl LeaderTimerTick {
    pub(crate) fn term(&self) -> Term {
        match self {
            LeaderTimerTick::Heartbeat { term, .. } => *term,
            LeaderTimerTick::Housekeeping { term } => *term,
        }
    }
}
