use crate::api::RaftError;
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, ChangeMembershipInput, InstallSnapshotInput, PreVoteInput, PreVoteOutput,
    RaftEndpoint, RaftGroupId, RequestVoteInput, RequestVoteOutput,
};
use serde::{Deserialize, Serialize};

/// RaftRequest is a member-to-member consensus message addressed to one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftRequest {
    pub group_id: RaftGroupId,
    pub message: RaftMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    PreVote(PreVoteInput),
    RequestVote(RequestVoteInput),
    AppendEntries(AppendEntriesInput),
    InstallSnapshot(InstallSnapshotInput),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    PreVote(PreVoteOutput),
    RequestVote(RequestVoteOutput),
    // Also the reply to InstallSnapshot.
    AppendEntries(AppendEntriesOutput),
    Rejected(RaftError),
}

/// InvocationRequest is a client operation routed to a member that is believed to be the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub group_id: RaftGroupId,
    pub op: InvocationOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InvocationOp {
    Replicate(Vec<u8>),
    ChangeMembership(ChangeMembershipInput),
    TerminateGroup,
    QueryMembers,
}

pub type InvocationResponse = Result<Vec<u8>, RaftError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    // Never delivered, so retrying elsewhere can't duplicate anything.
    #[error("Target unreachable: {0}")]
    Unreachable(String),
    // Possibly delivered.
    #[error("Connection to target lost: {0}")]
    Disconnected(String),
    #[error("Timed out waiting for target: {0}")]
    Timeout(String),
    #[error("Malformed reply: {0}")]
    Malformed(String),
}

/// RaftTransport moves requests between members. Delivery is best-effort: requests may be lost,
/// duplicated or reordered, and every caller retries on its own schedule.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send_raft(&self, target: &RaftEndpoint, request: RaftRequest) -> Result<RaftResponse, TransportError>;

    async fn invoke(
        &self,
        target: &RaftEndpoint,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, TransportError>;
}
