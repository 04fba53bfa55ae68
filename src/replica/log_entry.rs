use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::members::{MembershipChangeMode, RaftEndpoint, RaftGroupMembers};
use serde::{Deserialize, Serialize};
use std::fmt;

/// LogEntry is one replicated operation. `timestamp_millis` is the leader's wall clock when it
/// appended the entry; replicated services read time only from here.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub timestamp_millis: i64,
    pub op: RaftOp,
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogEntry({:?}@{:?}, {:?})", self.index, self.term, self.op)
    }
}

/// RaftOp is the closed set of operations the core knows about. Application operations are opaque
/// bytes owned by the group's `StateMachine`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftOp {
    Nop,
    UpdateGroupMembers {
        members: Vec<RaftEndpoint>,
        member: RaftEndpoint,
        mode: MembershipChangeMode,
    },
    TerminateGroup,
    Service(Vec<u8>),
}

impl fmt::Debug for RaftOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftOp::Nop => write!(f, "Nop"),
            RaftOp::UpdateGroupMembers { member, mode, .. } => {
                write!(f, "UpdateGroupMembers({:?} {:?})", mode, member.id)
            }
            RaftOp::TerminateGroup => write!(f, "TerminateGroup"),
            RaftOp::Service(bytes) => write!(f, "Service({} bytes)", bytes.len()),
        }
    }
}

/// SnapshotEntry replaces the log prefix up to and including `index`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub term: Term,
    pub index: Index,
    pub group_members: RaftGroupMembers,
    pub payload: Vec<u8>,
}

impl fmt::Debug for SnapshotEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapshotEntry({:?}@{:?}, members@{:?}, {} bytes)",
            self.index,
            self.term,
            self.group_members.index(),
            self.payload.len()
        )
    }
}
