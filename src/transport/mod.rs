mod api;
mod grpc_client;
mod local;
mod server;
mod shutdown;

pub use api::InvocationOp;
pub use api::InvocationRequest;
pub use api::InvocationResponse;
pub use api::RaftMessage;
pub use api::RaftRequest;
pub use api::RaftResponse;
pub use api::RaftTransport;
pub use api::TransportError;
pub use grpc_client::GrpcTransport;
pub use local::LocalNetwork;
pub use server::RpcServer;
pub use shutdown::shutdown_signal;
pub use shutdown::RpcServerShutdownHandle;
pub use shutdown::RpcServerShutdownSignal;
