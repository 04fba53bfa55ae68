use crate::node::RaftNodeRegistry;
use crate::replica::{RaftEndpoint, ReplicaId};
use crate::transport::{InvocationRequest, InvocationResponse, RaftRequest, RaftResponse, RaftTransport, TransportError};
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

/// LocalNetwork connects members running in the same process. Members can be crashed, and
/// isolated from each other's consensus traffic, to simulate failures.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    members: DashMap<ReplicaId, Arc<RaftNodeRegistry>>,
    isolated: DashSet<ReplicaId>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork {
            inner: Arc::new(Inner {
                members: DashMap::new(),
                isolated: DashSet::new(),
            }),
        }
    }

    /// Transport used by the member `source`. Isolation of `source` applies to its traffic.
    pub fn transport_for(&self, source: ReplicaId) -> Arc<dyn RaftTransport> {
        Arc::new(LocalTransport {
            source: Some(source),
            network: Arc::downgrade(&self.inner),
        })
    }

    /// Transport for clients that aren't members. Clients are never isolated.
    pub fn client_transport(&self) -> Arc<dyn RaftTransport> {
        Arc::new(LocalTransport {
            source: None,
            network: Arc::downgrade(&self.inner),
        })
    }

    pub fn register(&self, registry: Arc<RaftNodeRegistry>) {
        self.inner.members.insert(registry.local().id.clone(), registry);
    }

    pub fn member(&self, id: &ReplicaId) -> Option<Arc<RaftNodeRegistry>> {
        self.inner.members.get(id).map(|registry| registry.clone())
    }

    /// Unregisters the member and stops all of its groups.
    pub async fn crash(&self, id: &ReplicaId) {
        if let Some((_, registry)) = self.inner.members.remove(id) {
            registry.shutdown().await;
        }
    }

    /// Drops consensus traffic from and to `id` until healed. Client invocations still reach it.
    pub fn isolate(&self, id: &ReplicaId) {
        self.inner.isolated.insert(id.clone());
    }

    pub fn heal(&self, id: &ReplicaId) {
        self.inner.isolated.remove(id);
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalTransport {
    source: Option<ReplicaId>,
    network: Weak<Inner>,
}

impl LocalTransport {
    fn target_registry(&self, target: &RaftEndpoint) -> Result<Arc<RaftNodeRegistry>, TransportError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable("Network is gone".to_string()))?;

        let registry = network.members.get(&target.id).map(|registry| registry.clone());
        registry.ok_or_else(|| TransportError::Unreachable(format!("{:?} is not running", target.id)))
    }

    fn check_link(&self, target: &RaftEndpoint) -> Result<(), TransportError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable("Network is gone".to_string()))?;

        let source_isolated = self
            .source
            .as_ref()
            .map(|source| network.isolated.contains(source))
            .unwrap_or(false);
        if source_isolated || network.isolated.contains(&target.id) {
            return Err(TransportError::Unreachable(format!("Link to {:?} is down", target.id)));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl RaftTransport for LocalTransport {
    async fn send_raft(&self, target: &RaftEndpoint, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        self.check_link(target)?;
        let registry = self.target_registry(target)?;
        let response = registry.handle_raft_request(request).await;

        // The reply crosses the link too.
        self.check_link(target)
            .map_err(|_| TransportError::Disconnected(format!("Reply from {:?} was dropped", target.id)))?;
        Ok(response)
    }

    async fn invoke(
        &self,
        target: &RaftEndpoint,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        let registry = self.target_registry(target)?;
        Ok(registry.handle_invocation(request).await)
    }
}
