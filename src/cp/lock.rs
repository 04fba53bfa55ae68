use crate::api::{self, RaftError};
use crate::commitlog::Index;
use crate::cp::service::{self, BlockingService};
use crate::cp::wait::{self, WaitKey, WaitQueue};
use crate::invocation::InvocationUid;
use crate::replica::{ApplyContext, OpOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fence returned when a lock wasn't acquired.
pub const INVALID_FENCE: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Replies with the fence once acquired. Waits as long as it takes.
    Lock {
        name: String,
        endpoint: LockEndpoint,
        invocation_uid: InvocationUid,
    },
    /// Replies with the fence, or `INVALID_FENCE` if not acquired within the timeout.
    TryLock {
        name: String,
        endpoint: LockEndpoint,
        invocation_uid: InvocationUid,
        timeout_millis: i64,
    },
    /// Replies with the remaining reentrant lock count.
    Unlock {
        name: String,
        endpoint: LockEndpoint,
        invocation_uid: InvocationUid,
    },
    GetLockOwnershipState {
        name: String,
    },
    Destroy {
        name: String,
    },
}

impl LockOp {
    pub(crate) fn session_id(&self) -> Option<u64> {
        match self {
            LockOp::Lock { endpoint, .. } | LockOp::TryLock { endpoint, .. } | LockOp::Unlock { endpoint, .. } => {
                Some(endpoint.session_id)
            }
            LockOp::GetLockOwnershipState { .. } | LockOp::Destroy { .. } => None,
        }
    }
}

/// LockEndpoint is the holder identity of a fenced lock: a thread within a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockEndpoint {
    pub session_id: u64,
    pub thread_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwnershipState {
    pub fence: u64,
    pub lock_count: u32,
    pub session_id: u64,
    pub thread_id: u64,
}

impl LockOwnershipState {
    pub fn not_locked() -> Self {
        LockOwnershipState {
            fence: INVALID_FENCE,
            lock_count: 0,
            session_id: 0,
            thread_id: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.fence != INVALID_FENCE
    }

    pub fn is_locked_by(&self, endpoint: &LockEndpoint) -> bool {
        self.is_locked() && self.session_id == endpoint.session_id && self.thread_id == endpoint.thread_id
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FencedLock {
    owner: Option<LockEndpoint>,
    fence: u64,
    lock_count: u32,
    waiters: WaitQueue<LockEndpoint>,
    // Replies to the lock and unlock calls of the current holding, replayed to retries.
    invocation_results: BTreeMap<(LockEndpoint, InvocationUid), Vec<u8>>,
}

impl FencedLock {
    fn ownership_state(&self) -> LockOwnershipState {
        match self.owner {
            Some(owner) => LockOwnershipState {
                fence: self.fence,
                lock_count: self.lock_count,
                session_id: owner.session_id,
                thread_id: owner.thread_id,
            },
            None => LockOwnershipState::not_locked(),
        }
    }

    fn grant(&mut self, endpoint: LockEndpoint, invocation_uid: InvocationUid, fence: Index) -> Result<u64, RaftError> {
        self.owner = Some(endpoint);
        self.fence = fence.as_u64();
        self.lock_count = 1;
        self.invocation_results
            .insert((endpoint, invocation_uid), api::encode(&self.fence)?);

        Ok(self.fence)
    }

    fn record(&mut self, endpoint: LockEndpoint, invocation_uid: InvocationUid, reply: Vec<u8>) -> OpOutcome {
        self.invocation_results.insert((endpoint, invocation_uid), reply.clone());
        OpOutcome::Applied(reply)
    }

    /// Fully releases the lock and hands it to the first waiter, if any.
    fn release_and_grant_next(&mut self, ctx: &mut ApplyContext) {
        if let Some(previous) = self.owner.take() {
            self.invocation_results.retain(|(endpoint, _), _| *endpoint != previous);
        }
        self.lock_count = 0;

        if let Some(next) = self.waiters.pop_front() {
            let result = self.grant(next.request, next.invocation_uid, ctx.commit_index());
            ctx.complete(next.commit_index, result.and_then(|fence| api::encode(&fence)));
        }
    }
}

/// LockRegistry holds the fenced locks of one group.
pub(crate) struct LockRegistry {
    locks: BTreeMap<String, FencedLock>,
    reentrancy_limit: u32,
}

impl LockRegistry {
    pub(crate) fn new(reentrancy_limit: u32) -> Self {
        LockRegistry {
            locks: BTreeMap::new(),
            reentrancy_limit,
        }
    }

    pub(crate) fn apply(&mut self, ctx: &mut ApplyContext, op: LockOp) -> OpOutcome {
        match op {
            LockOp::Lock {
                name,
                endpoint,
                invocation_uid,
            } => self.acquire(ctx, name, endpoint, invocation_uid, None),
            LockOp::TryLock {
                name,
                endpoint,
                invocation_uid,
                timeout_millis,
            } => self.acquire(ctx, name, endpoint, invocation_uid, Some(timeout_millis)),
            LockOp::Unlock {
                name,
                endpoint,
                invocation_uid,
            } => self.release(ctx, &name, endpoint, invocation_uid),
            LockOp::GetLockOwnershipState { name } => {
                let state = self
                    .locks
                    .get(&name)
                    .map(FencedLock::ownership_state)
                    .unwrap_or_else(LockOwnershipState::not_locked);
                service::applied(&state)
            }
            LockOp::Destroy { name } => {
                let destroyed = match self.locks.remove(&name) {
                    Some(mut lock) => {
                        for key in lock.waiters.take_all() {
                            service::cancel(ctx, key.commit_index, "Lock is destroyed");
                        }
                        true
                    }
                    None => false,
                };
                service::applied(&destroyed)
            }
        }
    }

    // `timeout_millis` is None for `Lock`, which waits forever and fails loudly on the reentrancy
    // limit. `TryLock` answers with `INVALID_FENCE` instead.
    fn acquire(
        &mut self,
        ctx: &mut ApplyContext,
        name: String,
        endpoint: LockEndpoint,
        invocation_uid: InvocationUid,
        timeout_millis: Option<i64>,
    ) -> OpOutcome {
        let reentrancy_limit = self.reentrancy_limit;
        let lock = self.locks.entry(name.clone()).or_default();
        if let Some(reply) = lock.invocation_results.get(&(endpoint, invocation_uid)) {
            return OpOutcome::Applied(reply.clone());
        }

        match lock.owner {
            None => match lock.grant(endpoint, invocation_uid, ctx.commit_index()) {
                Ok(fence) => service::applied(&fence),
                Err(e) => OpOutcome::Failed(e),
            },
            Some(owner) if owner == endpoint => {
                if lock.lock_count >= reentrancy_limit {
                    return match timeout_millis {
                        None => OpOutcome::Failed(RaftError::IllegalMonitorState(format!(
                            "Lock {} reached its reentrancy limit of {}",
                            name, reentrancy_limit
                        ))),
                        Some(_) => service::applied(&INVALID_FENCE),
                    };
                }
                lock.lock_count += 1;
                match api::encode(&lock.fence) {
                    Ok(reply) => lock.record(endpoint, invocation_uid, reply),
                    Err(e) => OpOutcome::Failed(e),
                }
            }
            Some(_) => {
                let index = ctx.commit_index();
                if let Some(parked) = lock.waiters.retarget(invocation_uid, index) {
                    service::supersede(ctx, parked, index);
                    return OpOutcome::Postponed;
                }
                if matches!(timeout_millis, Some(timeout) if timeout <= 0) {
                    return service::applied(&INVALID_FENCE);
                }

                lock.waiters.push(WaitKey {
                    commit_index: ctx.commit_index(),
                    session_id: Some(endpoint.session_id),
                    invocation_uid,
                    deadline_millis: wait::deadline(ctx.timestamp_millis(), timeout_millis),
                    request: endpoint,
                });
                OpOutcome::Postponed
            }
        }
    }

    fn release(
        &mut self,
        ctx: &mut ApplyContext,
        name: &str,
        endpoint: LockEndpoint,
        invocation_uid: InvocationUid,
    ) -> OpOutcome {
        let lock = match self.locks.get_mut(name) {
            Some(lock) => lock,
            None => return not_owner(name),
        };
        if let Some(reply) = lock.invocation_results.get(&(endpoint, invocation_uid)) {
            return OpOutcome::Applied(reply.clone());
        }
        if lock.owner != Some(endpoint) {
            return not_owner(name);
        }

        lock.lock_count -= 1;
        let remaining = lock.lock_count;
        if remaining == 0 {
            lock.release_and_grant_next(ctx);
        }

        match api::encode(&remaining) {
            Ok(reply) => lock.record(endpoint, invocation_uid, reply),
            Err(e) => OpOutcome::Failed(e),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        api::encode(&self.locks)
    }

    pub(crate) fn restore(&mut self, snapshot: &[u8]) -> Result<(), RaftError> {
        self.locks = api::decode(snapshot)?;
        Ok(())
    }
}

fn not_owner(name: &str) -> OpOutcome {
    OpOutcome::Failed(RaftError::IllegalMonitorState(format!(
        "Current thread is not the owner of lock {}",
        name
    )))
}

impl BlockingService for LockRegistry {
    fn on_session_closed(&mut self, ctx: &mut ApplyContext, session_id: u64) {
        for lock in self.locks.values_mut() {
            for key in lock.waiters.take_session(session_id) {
                service::cancel(ctx, key.commit_index, "Session is closed");
            }
            if matches!(lock.owner, Some(owner) if owner.session_id == session_id) {
                lock.release_and_grant_next(ctx);
            }
            lock.invocation_results
                .retain(|(endpoint, _), _| endpoint.session_id != session_id);
        }
    }

    fn expire_wait_keys(&mut self, ctx: &mut ApplyContext) {
        let now = ctx.timestamp_millis();
        for lock in self.locks.values_mut() {
            for key in lock.waiters.take_expired(now) {
                service::complete(ctx, key.commit_index, &INVALID_FENCE);
            }
        }
    }

    fn has_expired_wait_keys(&self, now_millis: i64) -> bool {
        self.locks.values().any(|lock| lock.waiters.has_expired(now_millis))
    }

    fn cancel_all_wait_keys(&mut self, ctx: &mut ApplyContext) {
        for lock in self.locks.values_mut() {
            for key in lock.waiters.take_all() {
                service::cancel(ctx, key.commit_index, "Group is terminated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::RaftGroupId;

    fn ctx(index: u64, timestamp: i64) -> ApplyContext {
        ApplyContext::new(RaftGroupId::new("lock", 0), Index::new(index), timestamp)
    }

    fn endpoint(session_id: u64, thread_id: u64) -> LockEndpoint {
        LockEndpoint { session_id, thread_id }
    }

    fn uid(n: u128) -> InvocationUid {
        InvocationUid::from_u128(n)
    }

    fn lock_op(session_id: u64, uid_n: u128) -> LockOp {
        LockOp::Lock {
            name: "l".to_string(),
            endpoint: endpoint(session_id, 1),
            invocation_uid: uid(uid_n),
        }
    }

    fn unlock_op(session_id: u64, uid_n: u128) -> LockOp {
        LockOp::Unlock {
            name: "l".to_string(),
            endpoint: endpoint(session_id, 1),
            invocation_uid: uid(uid_n),
        }
    }

    fn decode_u64(outcome: OpOutcome) -> u64 {
        match outcome {
            OpOutcome::Applied(bytes) => api::decode(&bytes).unwrap(),
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    fn ownership(registry: &mut LockRegistry, index: u64) -> LockOwnershipState {
        let outcome = registry.apply(
            &mut ctx(index, 0),
            LockOp::GetLockOwnershipState { name: "l".to_string() },
        );
        match outcome {
            OpOutcome::Applied(bytes) => api::decode(&bytes).unwrap(),
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn retried_lock_is_acquired_once() {
        // -- setup --
        let mut registry = LockRegistry::new(u32::MAX);

        // -- execute --
        let fence = decode_u64(registry.apply(&mut ctx(5, 0), lock_op(1, 100)));
        let retried_fence = decode_u64(registry.apply(&mut ctx(9, 0), lock_op(1, 100)));

        // -- verify --
        assert_eq!(fence, 5);
        assert_eq!(retried_fence, 5);
        assert_eq!(
            ownership(&mut registry, 10),
            LockOwnershipState {
                fence: 5,
                lock_count: 1,
                session_id: 1,
                thread_id: 1,
            }
        );
    }

    #[test]
    fn reentrant_lock_counts_and_unlocks() {
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));
        decode_u64(registry.apply(&mut ctx(2, 0), lock_op(1, 2)));
        assert_eq!(ownership(&mut registry, 3).lock_count, 2);

        assert_eq!(decode_u32(registry.apply(&mut ctx(4, 0), unlock_op(1, 3))), 1);
        // Retried unlock doesn't release twice.
        assert_eq!(decode_u32(registry.apply(&mut ctx(5, 0), unlock_op(1, 3))), 1);
        assert_eq!(decode_u32(registry.apply(&mut ctx(6, 0), unlock_op(1, 4))), 0);
        assert!(!ownership(&mut registry, 7).is_locked());
    }

    fn decode_u32(outcome: OpOutcome) -> u32 {
        match outcome {
            OpOutcome::Applied(bytes) => api::decode(&bytes).unwrap(),
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn reentrancy_limit() {
        let mut registry = LockRegistry::new(1);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));

        assert!(matches!(
            registry.apply(&mut ctx(2, 0), lock_op(1, 2)),
            OpOutcome::Failed(RaftError::IllegalMonitorState(_))
        ));
        let try_lock = LockOp::TryLock {
            name: "l".to_string(),
            endpoint: endpoint(1, 1),
            invocation_uid: uid(3),
            timeout_millis: 0,
        };
        assert_eq!(decode_u64(registry.apply(&mut ctx(3, 0), try_lock)), INVALID_FENCE);
    }

    #[test]
    fn unlock_by_non_owner_fails() {
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));

        assert!(matches!(
            registry.apply(&mut ctx(2, 0), unlock_op(2, 2)),
            OpOutcome::Failed(RaftError::IllegalMonitorState(_))
        ));
    }

    #[test]
    fn waiter_is_granted_on_unlock_with_new_fence() {
        // -- setup --
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));
        assert_eq!(registry.apply(&mut ctx(2, 0), lock_op(2, 2)), OpOutcome::Postponed);

        // -- execute --
        let mut unlock_ctx = ctx(3, 0);
        registry.apply(&mut unlock_ctx, unlock_op(1, 3));

        // -- verify --
        let completions = unlock_ctx.take_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, Index::new(2));
        let fence: u64 = api::decode(completions[0].1.as_ref().unwrap()).unwrap();
        assert_eq!(fence, 3);
        assert!(ownership(&mut registry, 4).is_locked_by(&endpoint(2, 1)));
    }

    #[test]
    fn retried_wait_fails_the_superseded_caller_and_is_granted_once() {
        // -- setup --
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));
        assert_eq!(registry.apply(&mut ctx(2, 0), lock_op(2, 2)), OpOutcome::Postponed);

        // -- execute --
        let mut retry_ctx = ctx(5, 0);
        let retried = registry.apply(&mut retry_ctx, lock_op(2, 2));
        let mut unlock_ctx = ctx(6, 0);
        registry.apply(&mut unlock_ctx, unlock_op(1, 3));

        // -- verify --
        assert_eq!(retried, OpOutcome::Postponed);
        let superseded = retry_ctx.take_completions();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].0, Index::new(2));
        assert!(matches!(superseded[0].1, Err(RaftError::IndeterminateOperationState(_))));

        let granted = unlock_ctx.take_completions();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, Index::new(5));
        let fence: u64 = api::decode(granted[0].1.as_ref().unwrap()).unwrap();
        assert_eq!(fence, 6);
    }

    #[test]
    fn session_close_releases_lock_and_cancels_waits() {
        // -- setup --
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));
        assert_eq!(registry.apply(&mut ctx(2, 0), lock_op(2, 2)), OpOutcome::Postponed);
        let other_lock = LockOp::Lock {
            name: "other".to_string(),
            endpoint: endpoint(2, 1),
            invocation_uid: uid(3),
        };
        decode_u64(registry.apply(&mut ctx(3, 0), other_lock));
        let wait_other = LockOp::Lock {
            name: "other".to_string(),
            endpoint: endpoint(1, 1),
            invocation_uid: uid(4),
        };
        assert_eq!(registry.apply(&mut ctx(4, 0), wait_other), OpOutcome::Postponed);

        // -- execute --
        let mut close_ctx = ctx(5, 0);
        registry.on_session_closed(&mut close_ctx, 1);

        // -- verify --
        let completions = close_ctx.take_completions();
        assert_eq!(completions.len(), 2);
        let cancelled = completions.iter().find(|(index, _)| *index == Index::new(4)).unwrap();
        assert!(matches!(cancelled.1, Err(RaftError::WaitKeyCancelled(_))));
        let granted = completions.iter().find(|(index, _)| *index == Index::new(2)).unwrap();
        assert!(granted.1.is_ok());
        assert!(ownership(&mut registry, 6).is_locked_by(&endpoint(2, 1)));
    }

    #[test]
    fn try_lock_wait_expires_with_invalid_fence() {
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 1_000), lock_op(1, 1)));
        let try_lock = LockOp::TryLock {
            name: "l".to_string(),
            endpoint: endpoint(2, 1),
            invocation_uid: uid(2),
            timeout_millis: 500,
        };
        assert_eq!(registry.apply(&mut ctx(2, 1_000), try_lock), OpOutcome::Postponed);
        assert!(!registry.has_expired_wait_keys(1_499));
        assert!(registry.has_expired_wait_keys(1_500));

        let mut expire_ctx = ctx(3, 1_600);
        registry.expire_wait_keys(&mut expire_ctx);

        let completions = expire_ctx.take_completions();
        assert_eq!(completions.len(), 1);
        let fence: u64 = api::decode(completions[0].1.as_ref().unwrap()).unwrap();
        assert_eq!(fence, INVALID_FENCE);
    }

    #[test]
    fn snapshot_restores_holder_and_waiters() {
        let mut registry = LockRegistry::new(u32::MAX);
        decode_u64(registry.apply(&mut ctx(1, 0), lock_op(1, 1)));
        assert_eq!(registry.apply(&mut ctx(2, 0), lock_op(2, 2)), OpOutcome::Postponed);

        let mut restored = LockRegistry::new(u32::MAX);
        restored.restore(&registry.snapshot().unwrap()).unwrap();

        assert!(ownership(&mut restored, 3).is_locked_by(&endpoint(1, 1)));
        let mut unlock_ctx = ctx(4, 0);
        restored.apply(&mut unlock_ctx, unlock_op(1, 3));
        assert_eq!(unlock_ctx.take_completions()[0].0, Index::new(2));
    }
}
