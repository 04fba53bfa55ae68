mod election;
mod local_state;
mod log_entry;
mod members;
mod raft_log;
mod raft_node;
mod raft_state;
mod replica_api;
mod state_machine;

pub use election::ElectionStateChangeListener;
pub use election::ElectionStateSnapshot;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use log_entry::LogEntry;
pub use log_entry::RaftOp;
pub use log_entry::SnapshotEntry;
pub use members::MembershipChangeMode;
pub use members::RaftEndpoint;
pub use members::RaftGroupId;
pub use members::RaftGroupMembers;
pub use members::ReplicaId;
pub use raft_log::RaftLog;
pub use raft_log::RaftLogError;
pub(crate) use raft_node::RaftNode;
pub(crate) use raft_node::RaftNodeConfig;
pub use replica_api::AppendEntriesInput;
pub use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub use replica_api::ChangeMembershipInput;
pub use replica_api::ChangeMembershipOutput;
pub use replica_api::GroupMembersView;
pub use replica_api::InstallSnapshotInput;
pub(crate) use replica_api::LeaderTimerTick;
pub use replica_api::PreVoteInput;
pub use replica_api::PreVoteOutput;
pub(crate) use replica_api::PreVoteReplyFromPeer;
pub use replica_api::RaftNodeReport;
pub use replica_api::RaftNodeStatus;
pub use replica_api::RaftRole;
pub use replica_api::ReplicateInput;
pub use replica_api::RequestVoteInput;
pub use replica_api::RequestVoteOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub use state_machine::ApplyContext;
pub use state_machine::OpOutcome;
pub use state_machine::StateMachine;
