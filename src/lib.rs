mod actor;
mod api;
mod client;
mod commitlog;
mod cp;
mod invocation;
mod node;
mod replica;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::decode;
pub use api::encode;
pub use api::CpOptions;
pub use api::CpOptionsValidated;
pub use api::InvocationOptions;
pub use api::InvocationOptionsValidated;
pub use api::RaftError;
pub use api::RaftOptions;
pub use api::RaftOptionsValidated;
pub use client::AtomicLongProxy;
pub use client::AtomicRefProxy;
pub use client::ClientSessionManager;
pub use client::CountDownLatchProxy;
pub use client::CpClient;
pub use client::CpClientConfig;
pub use client::FencedLockProxy;
pub use client::SemaphoreProxy;
pub use commitlog::Index;
pub use cp::AtomicLongOp;
pub use cp::AtomicRefOp;
pub use cp::CpOp;
pub use cp::CpSession;
pub use cp::CpStateMachine;
pub use cp::LatchOp;
pub use cp::LockEndpoint;
pub use cp::LockOp;
pub use cp::LockOwnershipState;
pub use cp::SemaphoreOp;
pub use cp::SessionOp;
pub use cp::SessionResponse;
pub use cp::INVALID_FENCE;
pub use invocation::InvocationPolicy;
pub use invocation::InvocationUid;
pub use invocation::RaftInvocationManager;
pub use node::RaftNodeRegistry;
pub use node::RaftNodeRegistryConfig;
pub use node::StateMachineFactory;
pub use replica::ApplyContext;
pub use replica::ChangeMembershipInput;
pub use replica::ChangeMembershipOutput;
pub use replica::ElectionStateChangeListener;
pub use replica::ElectionStateSnapshot;
pub use replica::GroupMembersView;
pub use replica::MembershipChangeMode;
pub use replica::OpOutcome;
pub use replica::RaftEndpoint;
pub use replica::RaftGroupId;
pub use replica::RaftGroupMembers;
pub use replica::RaftNodeReport;
pub use replica::RaftNodeStatus;
pub use replica::RaftRole;
pub use replica::ReplicaId;
pub use replica::StateMachine;
pub use replica::Term;
pub use transport::GrpcTransport;
pub use transport::InvocationOp;
pub use transport::InvocationRequest;
pub use transport::InvocationResponse;
pub use transport::LocalNetwork;
pub use transport::RaftTransport;
pub use transport::RpcServer;
pub use transport::RpcServerShutdownHandle;
pub use transport::RpcServerShutdownSignal;
pub use transport::TransportError;
pub use transport::shutdown_signal;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
