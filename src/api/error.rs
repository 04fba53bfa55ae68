use crate::commitlog::Index;
use crate::replica::{RaftEndpoint, RaftGroupId};
use serde::{Deserialize, Serialize};

/// RaftError is the failure taxonomy shared by the consensus core, the replicated services, and
/// the invocation layer. It is serializable because it crosses the transport as a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RaftError {
    #[error("Not leader of group {group_id:?}. Last known leader: {leader:?}")]
    NotLeader {
        group_id: RaftGroupId,
        leader: Option<RaftEndpoint>,
    },

    // Can be retried after a backoff. Either too many uncommitted entries or a membership change
    // is in flight.
    #[error("Group {group_id:?} cannot replicate new entries right now")]
    CannotReplicate { group_id: RaftGroupId },

    #[error("Group {group_id:?} is terminated")]
    RaftGroupTerminated { group_id: RaftGroupId },

    #[error("Member {0:?} does not exist in the group")]
    MemberDoesNotExist(RaftEndpoint),

    #[error("Member {0:?} already exists in the group")]
    MemberAlreadyExists(RaftEndpoint),

    #[error("Expected group members commit index {expected:?}, but current is {actual:?}")]
    MismatchingGroupMembersCommitIndex { expected: Index, actual: Index },

    #[error("Session {session_id} is expired or closed")]
    SessionExpired { session_id: u64 },

    #[error("Illegal monitor state: {0}")]
    IllegalMonitorState(String),

    // Leader changed between append and commit acknowledgement. The operation may or may not have
    // been applied.
    #[error("Indeterminate operation state: {0}")]
    IndeterminateOperationState(String),

    #[error("Wait key cancelled: {0}")]
    WaitKeyCancelled(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out")]
    OperationTimeout,
}

impl RaftError {
    pub fn not_leader(group_id: &RaftGroupId, leader: Option<RaftEndpoint>) -> Self {
        RaftError::NotLeader {
            group_id: group_id.clone(),
            leader,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, RaftError::NotLeader { .. })
    }

    /// Terminal failures are never retried by the invocation layer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RaftError::RaftGroupTerminated { .. }
                | RaftError::MemberDoesNotExist(_)
                | RaftError::MemberAlreadyExists(_)
        )
    }

    pub fn leader_hint(&self) -> Option<&RaftEndpoint> {
        match self {
            RaftError::NotLeader { leader, .. } => leader.as_ref(),
            _ => None,
        }
    }
}
