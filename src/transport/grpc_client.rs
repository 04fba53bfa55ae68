use crate::api;
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{ProtoInvokeReq, ProtoRaftReq};
use crate::replica::{RaftEndpoint, ReplicaId};
use crate::transport::{InvocationRequest, InvocationResponse, RaftRequest, RaftResponse, RaftTransport, TransportError};
use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

/// GrpcTransport talks to other members over their `RpcServer`. Connections are established
/// lazily on first use and then reused.
pub struct GrpcTransport {
    logger: slog::Logger,
    source: ReplicaId,
    clients: DashMap<String, GrpcRaftClient<Channel>>,
}

impl GrpcTransport {
    pub fn new(logger: slog::Logger, source: ReplicaId) -> Self {
        GrpcTransport {
            logger,
            source,
            clients: DashMap::new(),
        }
    }

    fn client(&self, target: &RaftEndpoint) -> Result<GrpcRaftClient<Channel>, TransportError> {
        if let Some(client) = self.clients.get(&target.address) {
            return Ok(client.clone());
        }

        let url = format!("http://{}", target.address);
        slog::info!(self.logger, "Connecting to {} ...", url);
        let channel = Endpoint::from_shared(url)
            .map_err(|e| TransportError::Unreachable(format!("Invalid address {}: {}", target.address, e)))?
            .connect_lazy()
            .map_err(|e| TransportError::Unreachable(format!("{}", e)))?;

        let client = GrpcRaftClient::new(channel);
        self.clients.insert(target.address.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl RaftTransport for GrpcTransport {
    async fn send_raft(&self, target: &RaftEndpoint, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let payload = api::encode(&request).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let mut client = self.client(target)?;

        let reply = client
            .raft(ProtoRaftReq {
                source_replica_id: self.source.as_str().to_string(),
                payload,
            })
            .await
            .map_err(convert_status)?;

        api::decode(&reply.into_inner().payload).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn invoke(
        &self,
        target: &RaftEndpoint,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        let payload = api::encode(&request).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let mut client = self.client(target)?;

        let reply = client
            .invoke(ProtoInvokeReq { payload })
            .await
            .map_err(convert_status)?;

        api::decode(&reply.into_inner().payload).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

fn convert_status(status: tonic::Status) -> TransportError {
    match status.code() {
        Code::Unavailable => TransportError::Unreachable(status.message().to_string()),
        Code::DeadlineExceeded => TransportError::Timeout(status.message().to_string()),
        Code::InvalidArgument => TransportError::Malformed(status.message().to_string()),
        _ => TransportError::Disconnected(status.message().to_string()),
    }
}
