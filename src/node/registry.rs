use crate::actor::{ActorClient, ReplicaActor};
use crate::api::{self, RaftError, RaftOptionsValidated};
use crate::commitlog::InMemoryLog;
use crate::replica::{
    ElectionStateChangeListener, RaftEndpoint, RaftGroupId, RaftNode, RaftNodeConfig, RaftNodeReport, ReplicateInput,
    StateMachine, VolatileLocalState,
};
use crate::transport::{InvocationOp, InvocationRequest, InvocationResponse, RaftMessage, RaftRequest, RaftResponse, RaftTransport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Builds the replicated state machine of a newly created group.
pub type StateMachineFactory = Arc<dyn Fn(&RaftGroupId) -> Box<dyn StateMachine> + Send + Sync>;

pub struct RaftNodeRegistryConfig {
    pub logger: slog::Logger,
    pub local: RaftEndpoint,
    pub options: RaftOptionsValidated,
    pub transport: Arc<dyn RaftTransport>,
    pub state_machine_factory: StateMachineFactory,
}

struct GroupHandle {
    client: ActorClient,
    listener: ElectionStateChangeListener,
}

/// RaftNodeRegistry owns every group this member participates in. Groups are fully independent:
/// each one runs its own event loop and only the `RaftGroupId → group` map is shared.
pub struct RaftNodeRegistry {
    logger: slog::Logger,
    local: RaftEndpoint,
    options: RaftOptionsValidated,
    transport: Arc<dyn RaftTransport>,
    state_machine_factory: StateMachineFactory,
    groups: DashMap<RaftGroupId, GroupHandle>,
}

impl RaftNodeRegistry {
    pub fn new(config: RaftNodeRegistryConfig) -> Self {
        let logger = config
            .logger
            .new(slog::o!("Member" => config.local.id.as_str().to_string()));

        RaftNodeRegistry {
            logger,
            local: config.local,
            options: config.options,
            transport: config.transport,
            state_machine_factory: config.state_machine_factory,
            groups: DashMap::new(),
        }
    }

    pub fn local(&self) -> &RaftEndpoint {
        &self.local
    }

    /// Starts the local node of `group_id`. First call wins: creating a group that already runs
    /// here is a no-op. Must be called from within a tokio runtime.
    pub fn create_group(&self, group_id: RaftGroupId, initial_members: Vec<RaftEndpoint>) -> Result<(), RaftError> {
        if !initial_members.iter().any(|m| m.id == self.local.id) {
            return Err(RaftError::IllegalArgument(format!(
                "Local member {:?} is not in the initial members of {:?}",
                self.local.id, group_id
            )));
        }

        let vacant = match self.groups.entry(group_id.clone()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(vacant) => vacant,
        };

        let log = InMemoryLog::create().map_err(|e| RaftError::Internal(format!("Log creation failure: {}", e)))?;
        let (client, receiver) = ActorClient::new(group_id.clone(), self.options.actor_queue_size);
        let (node, listener) = RaftNode::new(RaftNodeConfig {
            logger: self.logger.clone(),
            group_id: group_id.clone(),
            local: self.local.clone(),
            initial_members,
            log,
            local_state: VolatileLocalState::new(self.local.id.clone()),
            state_machine: (self.state_machine_factory)(&group_id),
            transport: self.transport.clone(),
            actor_client: client.weak(),
            options: self.options.clone(),
        })?;

        tokio::spawn(ReplicaActor::new(receiver, node).run_event_loop());
        vacant.insert(GroupHandle { client, listener });
        slog::info!(self.logger, "Created group {:?}", group_id);

        Ok(())
    }

    pub fn group_ids(&self) -> Vec<RaftGroupId> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn election_listener(&self, group_id: &RaftGroupId) -> Option<ElectionStateChangeListener> {
        self.groups.get(group_id).map(|handle| handle.listener.clone())
    }

    pub async fn report(&self, group_id: &RaftGroupId) -> Result<RaftNodeReport, RaftError> {
        self.client(group_id)?.report().await
    }

    /// Stops the local node of `group_id`, e.g. after it was removed from the group.
    pub async fn destroy_group(&self, group_id: &RaftGroupId) {
        if let Some((_, handle)) = self.groups.remove(group_id) {
            handle.client.shutdown().await;
            slog::info!(self.logger, "Destroyed group {:?}", group_id);
        }
    }

    pub async fn shutdown(&self) {
        for group_id in self.group_ids() {
            self.destroy_group(&group_id).await;
        }
    }

    pub async fn handle_raft_request(&self, request: RaftRequest) -> RaftResponse {
        let client = match self.client(&request.group_id) {
            Ok(client) => client,
            Err(e) => return RaftResponse::Rejected(e),
        };

        let result = match request.message {
            RaftMessage::PreVote(input) => client.pre_vote(input).await.map(RaftResponse::PreVote),
            RaftMessage::RequestVote(input) => client.request_vote(input).await.map(RaftResponse::RequestVote),
            RaftMessage::AppendEntries(input) => client.append_entries(input).await.map(RaftResponse::AppendEntries),
            RaftMessage::InstallSnapshot(input) => {
                client.install_snapshot(input).await.map(RaftResponse::AppendEntries)
            }
        };

        result.unwrap_or_else(RaftResponse::Rejected)
    }

    pub async fn handle_invocation(&self, request: InvocationRequest) -> InvocationResponse {
        let client = self.client(&request.group_id)?;

        match request.op {
            InvocationOp::Replicate(op) => client.replicate(ReplicateInput { op }).await,
            InvocationOp::ChangeMembership(input) => api::encode(&client.change_membership(input).await?),
            InvocationOp::TerminateGroup => api::encode(&client.terminate_group().await?),
            InvocationOp::QueryMembers => api::encode(&client.query_members().await?),
        }
    }

    // Clones the handle out so no map guard is held across an await.
    fn client(&self, group_id: &RaftGroupId) -> Result<ActorClient, RaftError> {
        self.groups
            .get(group_id)
            .map(|handle| handle.client.clone())
            .ok_or_else(|| RaftError::not_leader(group_id, None))
    }
}
