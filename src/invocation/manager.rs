use crate::api::{self, InvocationOptionsValidated, RaftError};
use crate::cp::CpOp;
use crate::replica::{ChangeMembershipInput, ChangeMembershipOutput, GroupMembersView, RaftEndpoint, RaftGroupId};
use crate::transport::{InvocationOp, InvocationRequest, RaftTransport, TransportError};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};

/// InvocationPolicy tells the invocation layer which ambiguous failures it may retry on its own.
/// Anything it may not retry is surfaced to the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvocationPolicy {
    /// The target could not be reached, so the request was never delivered.
    pub retryable_on_target_leave: bool,
    /// The request may or may not have been applied. Only safe for operations that carry an
    /// invocation uid or are otherwise idempotent.
    pub retryable_on_indeterminate: bool,
}

impl InvocationPolicy {
    pub fn idempotent() -> Self {
        InvocationPolicy {
            retryable_on_target_leave: true,
            retryable_on_indeterminate: true,
        }
    }

    pub fn non_idempotent() -> Self {
        InvocationPolicy {
            retryable_on_target_leave: true,
            retryable_on_indeterminate: false,
        }
    }
}

#[derive(Clone)]
struct GroupRoute {
    members: Vec<RaftEndpoint>,
    leader: Option<RaftEndpoint>,
    // Round-robin cursor used while the leader is unknown.
    next_member: usize,
}

enum Attempt {
    Done(Result<Vec<u8>, RaftError>),
    // Try again right away, typically against a fresh leader hint.
    Retry,
    RetryAfterBackoff,
}

/// RaftInvocationManager routes client operations to the leader of their group. It keeps a
/// best-effort leader cache per group, follows `NotLeader` hints, and cycles through the known
/// members when there is no hint.
pub struct RaftInvocationManager {
    logger: slog::Logger,
    transport: Arc<dyn RaftTransport>,
    options: InvocationOptionsValidated,
    routes: DashMap<RaftGroupId, GroupRoute>,
}

impl RaftInvocationManager {
    pub fn new(logger: slog::Logger, transport: Arc<dyn RaftTransport>, options: InvocationOptionsValidated) -> Self {
        RaftInvocationManager {
            logger,
            transport,
            options,
            routes: DashMap::new(),
        }
    }

    /// Makes `group_id` routable. Re-registering replaces the member list and keeps the cached
    /// leader only if it is still a member.
    pub fn register_group(&self, group_id: RaftGroupId, members: Vec<RaftEndpoint>) {
        let mut route = self.routes.entry(group_id).or_insert_with(|| GroupRoute {
            members: Vec::new(),
            leader: None,
            next_member: 0,
        });
        let leader_is_member = route
            .leader
            .as_ref()
            .map_or(false, |leader| members.iter().any(|m| m.id == leader.id));
        if !leader_is_member {
            route.leader = None;
        }
        route.members = members;
    }

    pub fn known_leader(&self, group_id: &RaftGroupId) -> Option<RaftEndpoint> {
        self.routes.get(group_id).and_then(|route| route.leader.clone())
    }

    pub async fn invoke(
        &self,
        group_id: &RaftGroupId,
        op: InvocationOp,
        policy: InvocationPolicy,
    ) -> Result<Vec<u8>, RaftError> {
        let deadline = Instant::now() + self.options.invocation_timeout;
        let mut backoff = self.options.initial_retry_backoff;
        let request = InvocationRequest {
            group_id: group_id.clone(),
            op,
        };

        loop {
            let target = self.next_target(group_id)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = match time::timeout(remaining, self.transport.invoke(&target, request.clone())).await {
                Err(_) => return Err(RaftError::OperationTimeout),
                Ok(Ok(Ok(reply))) => {
                    self.set_leader(group_id, Some(target));
                    Attempt::Done(Ok(reply))
                }
                Ok(Ok(Err(e))) => self.on_raft_error(group_id, &target, e, policy),
                Ok(Err(e)) => self.on_transport_error(group_id, &target, e, policy),
            };

            match attempt {
                Attempt::Done(result) => return result,
                Attempt::Retry => {}
                Attempt::RetryAfterBackoff => {
                    if Instant::now() + backoff >= deadline {
                        return Err(RaftError::OperationTimeout);
                    }
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.options.max_retry_backoff);
                }
            }

            if Instant::now() >= deadline {
                return Err(RaftError::OperationTimeout);
            }
        }
    }

    /// Replicates a CP operation and decodes its result.
    pub async fn invoke_cp<T: DeserializeOwned>(
        &self,
        group_id: &RaftGroupId,
        op: &CpOp,
        policy: InvocationPolicy,
    ) -> Result<T, RaftError> {
        let reply = self
            .invoke(group_id, InvocationOp::Replicate(api::encode(op)?), policy)
            .await?;
        api::decode(&reply)
    }

    /// Replicates an operation that parks on the leader until its resource frees up or its own
    /// timeout passes, so the invocation deadline doesn't bound it. On `OperationTimeout` the
    /// operation is rebuilt and sent again under the same invocation uid, which moves the parked
    /// wait over to the new entry or replays the answer it already got.
    pub async fn invoke_cp_blocking<T, F>(&self, group_id: &RaftGroupId, build: F) -> Result<T, RaftError>
    where
        T: DeserializeOwned,
        F: Fn() -> CpOp,
    {
        loop {
            match self.invoke_cp(group_id, &build(), InvocationPolicy::idempotent()).await {
                Err(RaftError::OperationTimeout) => {
                    slog::debug!(self.logger, "Still waiting on group {:?}, re-sending the blocking call", group_id);
                }
                result => return result,
            }
        }
    }

    /// Fetches the committed members and leader of `group_id` and refreshes the route with them.
    pub async fn query_members(&self, group_id: &RaftGroupId) -> Result<GroupMembersView, RaftError> {
        let reply = self
            .invoke(group_id, InvocationOp::QueryMembers, InvocationPolicy::idempotent())
            .await?;
        let view: GroupMembersView = api::decode(&reply)?;

        self.register_group(group_id.clone(), view.members.members().to_vec());
        self.set_leader(group_id, Some(view.leader.clone()));
        Ok(view)
    }

    /// A change that may have been applied isn't retried: the caller re-reads the members and
    /// decides, since a blind retry would fail on the stale expected commit index anyway.
    pub async fn change_membership(
        &self,
        group_id: &RaftGroupId,
        input: ChangeMembershipInput,
    ) -> Result<ChangeMembershipOutput, RaftError> {
        let reply = self
            .invoke(
                group_id,
                InvocationOp::ChangeMembership(input),
                InvocationPolicy::non_idempotent(),
            )
            .await?;
        let output: ChangeMembershipOutput = api::decode(&reply)?;

        self.register_group(group_id.clone(), output.members.clone());
        Ok(output)
    }

    pub async fn terminate_group(&self, group_id: &RaftGroupId) -> Result<(), RaftError> {
        let reply = self
            .invoke(group_id, InvocationOp::TerminateGroup, InvocationPolicy::non_idempotent())
            .await?;
        api::decode(&reply)
    }

    fn on_raft_error(
        &self,
        group_id: &RaftGroupId,
        target: &RaftEndpoint,
        error: RaftError,
        policy: InvocationPolicy,
    ) -> Attempt {
        if let Some(hint) = error.leader_hint().filter(|hint| hint.id != target.id).cloned() {
            slog::debug!(self.logger, "Redirected from {:?} to {:?}", target.id, hint.id);
            self.set_leader(group_id, Some(hint));
            return Attempt::Retry;
        }
        if error.is_redirect() {
            // No usable hint. Likely an election in progress.
            self.set_leader(group_id, None);
            return Attempt::RetryAfterBackoff;
        }
        if error.is_terminal() {
            return Attempt::Done(Err(error));
        }

        match error {
            RaftError::CannotReplicate { .. } => {
                slog::warn!(self.logger, "Group {:?} is applying backpressure", group_id);
                Attempt::RetryAfterBackoff
            }
            RaftError::IndeterminateOperationState(_) if policy.retryable_on_indeterminate => {
                self.set_leader(group_id, None);
                Attempt::RetryAfterBackoff
            }
            e => Attempt::Done(Err(e)),
        }
    }

    fn on_transport_error(
        &self,
        group_id: &RaftGroupId,
        target: &RaftEndpoint,
        error: TransportError,
        policy: InvocationPolicy,
    ) -> Attempt {
        slog::debug!(self.logger, "Invocation to {:?} failed: {}", target.id, error);
        self.set_leader(group_id, None);

        match error {
            TransportError::Unreachable(_) if policy.retryable_on_target_leave => Attempt::RetryAfterBackoff,
            TransportError::Unreachable(_) => Attempt::Done(Err(RaftError::not_leader(group_id, None))),
            TransportError::Disconnected(_) | TransportError::Timeout(_) if policy.retryable_on_indeterminate => {
                Attempt::RetryAfterBackoff
            }
            TransportError::Disconnected(e) | TransportError::Timeout(e) => {
                Attempt::Done(Err(RaftError::IndeterminateOperationState(e)))
            }
            TransportError::Malformed(e) => Attempt::Done(Err(RaftError::Internal(e))),
        }
    }

    fn next_target(&self, group_id: &RaftGroupId) -> Result<RaftEndpoint, RaftError> {
        let mut route = self
            .routes
            .get_mut(group_id)
            .ok_or_else(|| RaftError::IllegalArgument(format!("Unknown group {:?}", group_id)))?;
        if let Some(leader) = &route.leader {
            return Ok(leader.clone());
        }
        if route.members.is_empty() {
            return Err(RaftError::IllegalArgument(format!("Group {:?} has no known members", group_id)));
        }

        let target = route.members[route.next_member % route.members.len()].clone();
        route.next_member = route.next_member.wrapping_add(1);
        Ok(target)
    }

    fn set_leader(&self, group_id: &RaftGroupId, leader: Option<RaftEndpoint>) {
        if let Some(mut route) = self.routes.get_mut(group_id) {
            route.leader = leader;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InvocationOptions;
    use crate::transport::{InvocationResponse, RaftRequest, RaftResponse};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Reply = Result<InvocationResponse, TransportError>;

    /// Replies from a script and records which member each invocation went to.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        targets: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                replies: Mutex::new(replies.into()),
                targets: Mutex::new(Vec::new()),
            })
        }

        fn targets(&self) -> Vec<String> {
            self.targets.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RaftTransport for ScriptedTransport {
        async fn send_raft(&self, _target: &RaftEndpoint, _request: RaftRequest) -> Result<RaftResponse, TransportError> {
            Err(TransportError::Unreachable("scripted".to_string()))
        }

        async fn invoke(&self, target: &RaftEndpoint, _request: InvocationRequest) -> Reply {
            self.targets.lock().unwrap().push(target.id.as_str().to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Err(RaftError::CannotReplicate { group_id: group() })))
        }
    }

    fn group() -> RaftGroupId {
        RaftGroupId::new("group", 0)
    }

    fn member(i: usize) -> RaftEndpoint {
        RaftEndpoint::new(format!("m{}", i), format!("127.0.0.1:{}", 7000 + i))
    }

    fn manager(transport: Arc<ScriptedTransport>, timeout_millis: u64) -> RaftInvocationManager {
        let options = InvocationOptions {
            invocation_timeout: Some(Duration::from_millis(timeout_millis)),
            initial_retry_backoff: Some(Duration::from_millis(5)),
            max_retry_backoff: Some(Duration::from_millis(20)),
        };
        let manager = RaftInvocationManager::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            transport,
            InvocationOptionsValidated::try_from(options).unwrap(),
        );
        manager.register_group(group(), vec![member(1), member(2), member(3)]);
        manager
    }

    #[tokio::test]
    async fn follows_leader_hint() {
        // -- setup --
        let transport = ScriptedTransport::new(vec![
            Ok(Err(RaftError::not_leader(&group(), Some(member(3))))),
            Ok(Ok(vec![42])),
        ]);
        let manager = manager(transport.clone(), 1000);

        // -- execute --
        let result = manager
            .invoke(&group(), InvocationOp::QueryMembers, InvocationPolicy::idempotent())
            .await;

        // -- verify --
        assert_eq!(result, Ok(vec![42]));
        assert_eq!(transport.targets(), vec!["m1", "m3"]);
        assert_eq!(manager.known_leader(&group()), Some(member(3)));
    }

    #[tokio::test]
    async fn cycles_members_without_hint() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Unreachable("down".to_string())),
            Ok(Err(RaftError::not_leader(&group(), None))),
            Ok(Ok(vec![7])),
        ]);
        let manager = manager(transport.clone(), 1000);

        let result = manager
            .invoke(&group(), InvocationOp::QueryMembers, InvocationPolicy::idempotent())
            .await;

        assert_eq!(result, Ok(vec![7]));
        assert_eq!(transport.targets(), vec!["m1", "m2", "m3"]);
        assert_eq!(manager.known_leader(&group()), Some(member(3)));
    }

    #[tokio::test]
    async fn indeterminate_is_retried_only_when_allowed() {
        let indeterminate = || Ok(Err(RaftError::IndeterminateOperationState("leader lost".to_string())));

        let transport = ScriptedTransport::new(vec![indeterminate(), Ok(Ok(vec![1]))]);
        let retried = manager(transport, 1000)
            .invoke(&group(), InvocationOp::TerminateGroup, InvocationPolicy::idempotent())
            .await;
        assert_eq!(retried, Ok(vec![1]));

        let transport = ScriptedTransport::new(vec![indeterminate(), Ok(Ok(vec![1]))]);
        let surfaced = manager(transport.clone(), 1000)
            .invoke(&group(), InvocationOp::TerminateGroup, InvocationPolicy::non_idempotent())
            .await;
        assert!(matches!(surfaced, Err(RaftError::IndeterminateOperationState(_))));
        assert_eq!(transport.targets().len(), 1);

        let transport = ScriptedTransport::new(vec![Err(TransportError::Disconnected("reset".to_string()))]);
        let surfaced = manager(transport, 1000)
            .invoke(&group(), InvocationOp::TerminateGroup, InvocationPolicy::non_idempotent())
            .await;
        assert!(matches!(surfaced, Err(RaftError::IndeterminateOperationState(_))));
    }

    #[tokio::test]
    async fn terminal_errors_surface_immediately() {
        let transport = ScriptedTransport::new(vec![
            Ok(Err(RaftError::RaftGroupTerminated { group_id: group() })),
            Ok(Ok(vec![1])),
        ]);
        let manager = manager(transport.clone(), 1000);

        let result = manager
            .invoke(&group(), InvocationOp::QueryMembers, InvocationPolicy::idempotent())
            .await;

        assert_eq!(result, Err(RaftError::RaftGroupTerminated { group_id: group() }));
        assert_eq!(transport.targets().len(), 1);
    }

    #[tokio::test]
    async fn backpressure_until_timeout() {
        // An empty script answers CannotReplicate forever.
        let transport = ScriptedTransport::new(vec![]);
        let manager = manager(transport.clone(), 100);

        let result = manager
            .invoke(&group(), InvocationOp::QueryMembers, InvocationPolicy::idempotent())
            .await;

        assert_eq!(result, Err(RaftError::OperationTimeout));
        assert!(transport.targets().len() > 1);
    }

    /// Holds the first invocation past the invocation timeout, then answers the rest.
    struct SlowFirstReply {
        ops: Mutex<Vec<CpOp>>,
        reply: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl RaftTransport for SlowFirstReply {
        async fn send_raft(&self, _target: &RaftEndpoint, _request: RaftRequest) -> Result<RaftResponse, TransportError> {
            Err(TransportError::Unreachable("scripted".to_string()))
        }

        async fn invoke(&self, _target: &RaftEndpoint, request: InvocationRequest) -> Reply {
            let op = match request.op {
                InvocationOp::Replicate(bytes) => api::decode::<CpOp>(&bytes).unwrap(),
                other => panic!("Unexpected invocation {:?}", other),
            };
            let first = {
                let mut ops = self.ops.lock().unwrap();
                ops.push(op);
                ops.len() == 1
            };
            if first {
                time::sleep(Duration::from_millis(500)).await;
            }
            Ok(Ok(self.reply.clone()))
        }
    }

    #[tokio::test]
    async fn blocking_call_outlives_invocation_timeout() {
        // -- setup --
        let transport = Arc::new(SlowFirstReply {
            ops: Mutex::new(Vec::new()),
            reply: api::encode(&7u64).unwrap(),
        });
        let manager = RaftInvocationManager::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            transport.clone(),
            InvocationOptionsValidated::try_from(InvocationOptions {
                invocation_timeout: Some(Duration::from_millis(100)),
                initial_retry_backoff: Some(Duration::from_millis(5)),
                max_retry_backoff: Some(Duration::from_millis(20)),
            })
            .unwrap(),
        );
        manager.register_group(group(), vec![member(1)]);
        let uid = crate::invocation::InvocationUid::new_random();

        // -- execute --
        let fence: Result<u64, RaftError> = manager
            .invoke_cp_blocking(&group(), || {
                CpOp::Lock(crate::cp::LockOp::Lock {
                    name: "l".to_string(),
                    endpoint: crate::cp::LockEndpoint {
                        session_id: 1,
                        thread_id: 1,
                    },
                    invocation_uid: uid,
                })
            })
            .await;

        // -- verify --
        assert_eq!(fence, Ok(7));
        let ops = transport.ops.lock().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], ops[1]);
    }

    #[tokio::test]
    async fn unknown_group_is_rejected() {
        let manager = manager(ScriptedTransport::new(vec![]), 1000);

        let result = manager
            .invoke(
                &RaftGroupId::new("other", 0),
                InvocationOp::QueryMembers,
                InvocationPolicy::idempotent(),
            )
            .await;

        assert!(matches!(result, Err(RaftError::IllegalArgument(_))));
    }
}
