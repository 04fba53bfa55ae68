use crate::api::InvocationOptionsValidated;
use crate::client::{
    AtomicLongProxy, AtomicRefProxy, ClientSessionManager, CountDownLatchProxy, FencedLockProxy, SemaphoreProxy,
};
use crate::invocation::RaftInvocationManager;
use crate::replica::{RaftEndpoint, RaftGroupId};
use crate::transport::RaftTransport;
use std::sync::Arc;

pub struct CpClientConfig {
    pub logger: slog::Logger,
    /// Shows up as the endpoint of this client's sessions.
    pub name: String,
    pub transport: Arc<dyn RaftTransport>,
    pub options: InvocationOptionsValidated,
}

/// CpClient hands out proxies to the data structures of the groups it knows about. Proxies of the
/// same client share its sessions and holder identity.
pub struct CpClient {
    invocation: Arc<RaftInvocationManager>,
    sessions: Arc<ClientSessionManager>,
}

impl CpClient {
    pub fn new(config: CpClientConfig) -> Self {
        let logger = config.logger.new(slog::o!("Client" => config.name.clone()));
        let invocation = Arc::new(RaftInvocationManager::new(
            logger.clone(),
            config.transport,
            config.options,
        ));
        let sessions = Arc::new(ClientSessionManager::new(logger, invocation.clone(), config.name));

        CpClient { invocation, sessions }
    }

    pub fn register_group(&self, group_id: RaftGroupId, members: Vec<RaftEndpoint>) {
        self.invocation.register_group(group_id, members);
    }

    pub fn invocation(&self) -> &Arc<RaftInvocationManager> {
        &self.invocation
    }

    pub fn sessions(&self) -> &Arc<ClientSessionManager> {
        &self.sessions
    }

    pub fn lock(&self, group_id: &RaftGroupId, name: &str) -> FencedLockProxy {
        FencedLockProxy::new(
            group_id.clone(),
            name.to_string(),
            self.invocation.clone(),
            self.sessions.clone(),
        )
    }

    pub fn semaphore(&self, group_id: &RaftGroupId, name: &str) -> SemaphoreProxy {
        SemaphoreProxy::new(
            group_id.clone(),
            name.to_string(),
            self.invocation.clone(),
            self.sessions.clone(),
        )
    }

    pub fn count_down_latch(&self, group_id: &RaftGroupId, name: &str) -> CountDownLatchProxy {
        CountDownLatchProxy::new(group_id.clone(), name.to_string(), self.invocation.clone())
    }

    pub fn atomic_long(&self, group_id: &RaftGroupId, name: &str) -> AtomicLongProxy {
        AtomicLongProxy::new(group_id.clone(), name.to_string(), self.invocation.clone())
    }

    pub fn atomic_ref(&self, group_id: &RaftGroupId, name: &str) -> AtomicRefProxy {
        AtomicRefProxy::new(group_id.clone(), name.to_string(), self.invocation.clone())
    }

    /// Closes this client's sessions, releasing whatever it still holds.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
