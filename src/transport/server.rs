use crate::api::{self, RaftError};
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{ProtoInvokeReply, ProtoInvokeReq, ProtoRaftReply, ProtoRaftReq};
use crate::node::RaftNodeRegistry;
use crate::transport::{InvocationRequest, InvocationResponse, RaftRequest, RpcServerShutdownSignal};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface. It serves every group of the
/// local member.
pub struct RpcServer {
    logger: slog::Logger,
    registry: Arc<RaftNodeRegistry>,
}

impl RpcServer {
    pub fn new(logger: slog::Logger, registry: Arc<RaftNodeRegistry>) -> Self {
        RpcServer { logger, registry }
    }

    pub async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        // TODO:2 if server port is unavailable, signal back to caller.
        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_raft(&self, rpc_request: ProtoRaftReq) -> Result<ProtoRaftReply, Status> {
        let app_request: RaftRequest = api::decode(&rpc_request.payload).map_err(convert_decode_error)?;
        let app_reply = self.registry.handle_raft_request(app_request).await;
        let payload = api::encode(&app_reply).map_err(convert_internal_error)?;

        Ok(ProtoRaftReply { payload })
    }

    async fn handle_invoke(&self, rpc_request: ProtoInvokeReq) -> Result<ProtoInvokeReply, Status> {
        let app_request: InvocationRequest = api::decode(&rpc_request.payload).map_err(convert_decode_error)?;
        let app_reply: InvocationResponse = self.registry.handle_invocation(app_request).await;
        let payload = api::encode(&app_reply).map_err(convert_internal_error)?;

        Ok(ProtoInvokeReply { payload })
    }
}

fn convert_decode_error(e: RaftError) -> Status {
    Status::invalid_argument(e.to_string())
}

fn convert_internal_error(e: RaftError) -> Status {
    Status::internal(e.to_string())
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn raft(&self, rpc_request_wrapped: Request<ProtoRaftReq>) -> Result<Response<ProtoRaftReply>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - {} bytes from {}",
            rpc_request.payload.len(),
            rpc_request.source_replica_id
        );
        let rpc_result = self.handle_raft(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result.as_ref().map(|r| r.payload.len()));

        rpc_result.map(Response::new)
    }

    async fn invoke(&self, rpc_request_wrapped: Request<ProtoInvokeReq>) -> Result<Response<ProtoInvokeReply>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - Invoke {} bytes", rpc_request.payload.len());
        let rpc_result = self.handle_invoke(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result.as_ref().map(|r| r.payload.len()));

        rpc_result.map(Response::new)
    }
}
