use crate::api::{self, CpOptionsValidated, RaftError};
use crate::commitlog::Index;
use crate::cp::atomic::{AtomicLongRegistry, AtomicRefRegistry};
use crate::cp::latch::LatchRegistry;
use crate::cp::lock::LockRegistry;
use crate::cp::op::CpOp;
use crate::cp::semaphore::SemaphoreRegistry;
use crate::cp::service::{self, BlockingService};
use crate::cp::session::{SessionOp, SessionRegistry, SessionResponse};
use crate::node::StateMachineFactory;
use crate::replica::{ApplyContext, OpOutcome, RaftGroupId, StateMachine};
use std::collections::BTreeMap;
use std::sync::Arc;

const SESSION_SERVICE: &str = "session";
const LOCK_SERVICE: &str = "lock";
const SEMAPHORE_SERVICE: &str = "semaphore";
const LATCH_SERVICE: &str = "latch";
const ATOMIC_LONG_SERVICE: &str = "atomic_long";
const ATOMIC_REF_SERVICE: &str = "atomic_ref";

/// CpStateMachine is the replicated state of one CP group: the session table plus every
/// data structure service. Snapshots bundle each service's snapshot keyed by service name.
pub struct CpStateMachine {
    logger: slog::Logger,
    session_ttl_millis: i64,
    session_heartbeat_millis: i64,
    lock_reentrancy_limit: u32,
    sessions: SessionRegistry,
    locks: LockRegistry,
    semaphores: SemaphoreRegistry,
    latches: LatchRegistry,
    atomic_longs: AtomicLongRegistry,
    atomic_refs: AtomicRefRegistry,
}

impl CpStateMachine {
    pub fn new(logger: slog::Logger, options: &CpOptionsValidated) -> Self {
        CpStateMachine {
            logger,
            session_ttl_millis: options.session_ttl.as_millis() as i64,
            session_heartbeat_millis: options.session_heartbeat_interval.as_millis() as i64,
            lock_reentrancy_limit: options.lock_reentrancy_limit,
            sessions: SessionRegistry::default(),
            locks: LockRegistry::new(options.lock_reentrancy_limit),
            semaphores: SemaphoreRegistry::default(),
            latches: LatchRegistry::default(),
            atomic_longs: AtomicLongRegistry::default(),
            atomic_refs: AtomicRefRegistry::default(),
        }
    }

    /// Factory for `RaftNodeRegistry`, giving every group its own `CpStateMachine`.
    pub fn factory(logger: slog::Logger, options: CpOptionsValidated) -> StateMachineFactory {
        Arc::new(move |group_id: &RaftGroupId| {
            let logger = logger.new(slog::o!("CpGroup" => group_id.name.clone()));
            Box::new(CpStateMachine::new(logger, &options)) as Box<dyn StateMachine>
        })
    }

    fn blocking_services(&mut self) -> [&mut dyn BlockingService; 3] {
        [
            &mut self.locks as &mut dyn BlockingService,
            &mut self.semaphores as &mut dyn BlockingService,
            &mut self.latches as &mut dyn BlockingService,
        ]
    }

    fn apply_session_op(&mut self, ctx: &mut ApplyContext, op: SessionOp) -> OpOutcome {
        let now = ctx.timestamp_millis();
        match op {
            SessionOp::CreateSession { endpoint } => {
                let session_id = ctx.commit_index().as_u64();
                self.sessions.create(session_id, endpoint, now, self.session_ttl_millis);
                slog::info!(self.logger, "Created session {}", session_id);
                service::applied(&SessionResponse {
                    session_id,
                    ttl_millis: self.session_ttl_millis,
                    heartbeat_millis: self.session_heartbeat_millis,
                })
            }
            SessionOp::HeartbeatSession { session_id } => {
                match self.sessions.heartbeat(session_id, now, self.session_ttl_millis) {
                    Ok(()) => service::applied(&()),
                    Err(e) => OpOutcome::Failed(e),
                }
            }
            SessionOp::CloseSession { session_id } => {
                let closed = self.sessions.close(session_id);
                if closed {
                    slog::info!(self.logger, "Closed session {}", session_id);
                    self.release_session(ctx, session_id);
                }
                service::applied(&closed)
            }
            SessionOp::ExpireSessions { candidates } => {
                let expired = self.sessions.expire(&candidates, now);
                for session_id in &expired {
                    slog::info!(self.logger, "Session {} expired", session_id);
                    self.release_session(ctx, *session_id);
                }
                service::applied(&(expired.len() as u64))
            }
            SessionOp::GenerateThreadId => service::applied(&self.sessions.generate_thread_id()),
            SessionOp::GetSession { session_id } => service::applied(&self.sessions.get(session_id)),
        }
    }

    fn release_session(&mut self, ctx: &mut ApplyContext, session_id: u64) {
        for blocking in self.blocking_services().iter_mut() {
            blocking.on_session_closed(ctx, session_id);
        }
    }
}

impl StateMachine for CpStateMachine {
    fn apply(&mut self, ctx: &mut ApplyContext, op: &[u8]) -> OpOutcome {
        let op: CpOp = match api::decode(op) {
            Ok(op) => op,
            Err(e) => {
                slog::error!(
                    self.logger,
                    "Dropping undecodable operation at {:?}: {:?}",
                    ctx.commit_index(),
                    e
                );
                return OpOutcome::Failed(e);
            }
        };

        if let Some(session_id) = op.session_id() {
            if let Err(e) = self
                .sessions
                .heartbeat(session_id, ctx.timestamp_millis(), self.session_ttl_millis)
            {
                return OpOutcome::Failed(e);
            }
        }

        match op {
            CpOp::Session(op) => self.apply_session_op(ctx, op),
            CpOp::Lock(op) => self.locks.apply(ctx, op),
            CpOp::Semaphore(op) => self.semaphores.apply(ctx, op),
            CpOp::Latch(op) => self.latches.apply(ctx, op),
            CpOp::AtomicLong(op) => self.atomic_longs.apply(op),
            CpOp::AtomicRef(op) => self.atomic_refs.apply(op),
            CpOp::ExpireWaitKeys => {
                for blocking in self.blocking_services().iter_mut() {
                    blocking.expire_wait_keys(ctx);
                }
                service::applied(&())
            }
        }
    }

    fn take_snapshot(&self, _group_id: &RaftGroupId, _commit_index: Index) -> Result<Vec<u8>, RaftError> {
        let mut services = BTreeMap::new();
        services.insert(SESSION_SERVICE.to_string(), api::encode(&self.sessions)?);
        services.insert(LOCK_SERVICE.to_string(), self.locks.snapshot()?);
        services.insert(SEMAPHORE_SERVICE.to_string(), self.semaphores.snapshot()?);
        services.insert(LATCH_SERVICE.to_string(), self.latches.snapshot()?);
        services.insert(ATOMIC_LONG_SERVICE.to_string(), self.atomic_longs.snapshot()?);
        services.insert(ATOMIC_REF_SERVICE.to_string(), self.atomic_refs.snapshot()?);

        api::encode(&services)
    }

    fn restore_snapshot(&mut self, group_id: &RaftGroupId, commit_index: Index, snapshot: &[u8]) -> Result<(), RaftError> {
        let services: BTreeMap<String, Vec<u8>> = api::decode(snapshot)?;

        self.sessions = SessionRegistry::default();
        self.locks = LockRegistry::new(self.lock_reentrancy_limit);
        self.semaphores = SemaphoreRegistry::default();
        self.latches = LatchRegistry::default();
        self.atomic_longs = AtomicLongRegistry::default();
        self.atomic_refs = AtomicRefRegistry::default();

        for (name, payload) in &services {
            match name.as_str() {
                SESSION_SERVICE => self.sessions = api::decode(payload)?,
                LOCK_SERVICE => self.locks.restore(payload)?,
                SEMAPHORE_SERVICE => self.semaphores.restore(payload)?,
                LATCH_SERVICE => self.latches.restore(payload)?,
                ATOMIC_LONG_SERVICE => self.atomic_longs.restore(payload)?,
                ATOMIC_REF_SERVICE => self.atomic_refs.restore(payload)?,
                unknown => slog::warn!(self.logger, "Ignoring snapshot of unknown service '{}'", unknown),
            }
        }
        slog::info!(
            self.logger,
            "Restored snapshot of {:?} at {:?} with {} services",
            group_id,
            commit_index,
            services.len()
        );

        Ok(())
    }

    fn housekeeping_ops(&self, now_millis: i64) -> Vec<Vec<u8>> {
        let mut ops = Vec::new();

        let candidates = self.sessions.expiration_candidates(now_millis);
        if !candidates.is_empty() {
            ops.push(CpOp::Session(SessionOp::ExpireSessions { candidates }));
        }
        let has_expired_wait_keys = self.locks.has_expired_wait_keys(now_millis)
            || self.semaphores.has_expired_wait_keys(now_millis)
            || self.latches.has_expired_wait_keys(now_millis);
        if has_expired_wait_keys {
            ops.push(CpOp::ExpireWaitKeys);
        }

        ops.iter()
            .filter_map(|op| match api::encode(op) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    slog::error!(self.logger, "Failed to encode {:?}: {:?}", op, e);
                    None
                }
            })
            .collect()
    }

    fn on_group_terminated(&mut self, ctx: &mut ApplyContext) {
        for blocking in self.blocking_services().iter_mut() {
            blocking.cancel_all_wait_keys(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CpOptions;
    use crate::cp::atomic::AtomicLongOp;
    use crate::cp::lock::{LockEndpoint, LockOp, LockOwnershipState};
    use crate::cp::semaphore::SemaphoreOp;
    use crate::invocation::InvocationUid;
    use std::convert::TryFrom;
    use std::time::Duration;

    const TTL_MILLIS: i64 = 10_000;

    fn state_machine() -> CpStateMachine {
        let options = CpOptionsValidated::try_from(CpOptions {
            session_ttl: Some(Duration::from_millis(TTL_MILLIS as u64)),
            session_heartbeat_interval: Some(Duration::from_millis(1_000)),
            ..CpOptions::default()
        })
        .unwrap();
        CpStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()), &options)
    }

    struct Driver {
        sm: CpStateMachine,
        index: u64,
        now: i64,
    }

    impl Driver {
        fn new() -> Self {
            Driver {
                sm: state_machine(),
                index: 0,
                now: 1_000,
            }
        }

        fn apply(&mut self, op: CpOp) -> (OpOutcome, Vec<(Index, Result<Vec<u8>, RaftError>)>) {
            self.index += 1;
            let mut ctx = ApplyContext::new(RaftGroupId::new("cp", 0), Index::new(self.index), self.now);
            let outcome = self.sm.apply(&mut ctx, &api::encode(&op).unwrap());
            (outcome, ctx.take_completions())
        }

        fn applied<T: serde::de::DeserializeOwned>(&mut self, op: CpOp) -> T {
            match self.apply(op).0 {
                OpOutcome::Applied(bytes) => api::decode(&bytes).unwrap(),
                other => panic!("Unexpected outcome {:?}", other),
            }
        }

        fn create_session(&mut self) -> u64 {
            let response: SessionResponse = self.applied(CpOp::Session(SessionOp::CreateSession {
                endpoint: "client".to_string(),
            }));
            response.session_id
        }
    }

    fn lock(session_id: u64, uid: u128) -> CpOp {
        CpOp::Lock(LockOp::Lock {
            name: "lock".to_string(),
            endpoint: LockEndpoint { session_id, thread_id: 1 },
            invocation_uid: InvocationUid::from_u128(uid),
        })
    }

    fn ownership() -> CpOp {
        CpOp::Lock(LockOp::GetLockOwnershipState { name: "lock".to_string() })
    }

    #[test]
    fn session_ops_fail_after_session_closed() {
        let mut driver = Driver::new();
        let session_id = driver.create_session();
        assert!(driver.applied::<bool>(CpOp::Session(SessionOp::CloseSession { session_id })));

        let (outcome, _) = driver.apply(lock(session_id, 1));

        assert_eq!(outcome, OpOutcome::Failed(RaftError::SessionExpired { session_id }));
    }

    #[test]
    fn expired_session_releases_lock_to_waiter() {
        // -- setup --
        let mut driver = Driver::new();
        let holder = driver.create_session();
        let waiter = driver.create_session();
        driver.applied::<u64>(lock(holder, 1));
        let (outcome, _) = driver.apply(lock(waiter, 2));
        assert_eq!(outcome, OpOutcome::Postponed);
        let waiter_index = Index::new(driver.index);

        // The waiter keeps its session alive, the holder doesn't.
        driver.now += TTL_MILLIS - 1;
        driver.applied::<()>(CpOp::Session(SessionOp::HeartbeatSession { session_id: waiter }));
        driver.now += 2;

        // -- execute --
        let ops = driver.sm.housekeeping_ops(driver.now);
        assert_eq!(ops.len(), 1);
        let expire: CpOp = api::decode(&ops[0]).unwrap();
        let (_, completions) = driver.apply(expire);

        // -- verify --
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, waiter_index);
        let state: LockOwnershipState = driver.applied(ownership());
        assert_eq!(state.session_id, waiter);
        assert_eq!(state.lock_count, 1);
    }

    #[test]
    fn semaphore_wait_expires_through_housekeeping() {
        let mut driver = Driver::new();
        let session_id = driver.create_session();
        driver.applied::<bool>(CpOp::Semaphore(SemaphoreOp::Init {
            name: "s".to_string(),
            permits: 0,
        }));
        let (outcome, _) = driver.apply(CpOp::Semaphore(SemaphoreOp::Acquire {
            name: "s".to_string(),
            session_id,
            thread_id: 1,
            invocation_uid: InvocationUid::from_u128(1),
            permits: 1,
            timeout_millis: Some(100),
        }));
        assert_eq!(outcome, OpOutcome::Postponed);

        assert!(driver.sm.housekeeping_ops(driver.now + 99).is_empty());
        driver.now += 100;
        let ops = driver.sm.housekeeping_ops(driver.now);
        assert_eq!(ops, vec![api::encode(&CpOp::ExpireWaitKeys).unwrap()]);

        let (_, completions) = driver.apply(CpOp::ExpireWaitKeys);
        assert_eq!(completions.len(), 1);
        assert!(!api::decode::<bool>(completions[0].1.as_ref().unwrap()).unwrap());
    }

    #[test]
    fn termination_cancels_waiters() {
        let mut driver = Driver::new();
        let holder = driver.create_session();
        let waiter = driver.create_session();
        driver.applied::<u64>(lock(holder, 1));
        driver.apply(lock(waiter, 2));

        let mut ctx = ApplyContext::new(RaftGroupId::new("cp", 0), Index::new(99), driver.now);
        driver.sm.on_group_terminated(&mut ctx);

        let completions = ctx.take_completions();
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].1, Err(RaftError::WaitKeyCancelled(_))));
    }

    #[test]
    fn snapshot_restores_every_service() {
        // -- setup --
        let mut driver = Driver::new();
        let session_id = driver.create_session();
        driver.applied::<u64>(lock(session_id, 1));
        driver.applied::<i64>(CpOp::AtomicLong(AtomicLongOp::AddAndGet {
            name: "n".to_string(),
            delta: 3,
        }));
        let group_id = RaftGroupId::new("cp", 0);
        let snapshot = driver.sm.take_snapshot(&group_id, Index::new(driver.index)).unwrap();

        // -- execute --
        let mut restored = Driver::new();
        restored
            .sm
            .restore_snapshot(&group_id, Index::new(driver.index), &snapshot)
            .unwrap();
        restored.index = driver.index;

        // -- verify --
        let state: LockOwnershipState = restored.applied(ownership());
        assert_eq!(state.session_id, session_id);
        let value: i64 = restored.applied(CpOp::AtomicLong(AtomicLongOp::Get {
            name: "n".to_string(),
        }));
        assert_eq!(value, 3);
        assert!(restored.sm.sessions.get(session_id).is_some());
    }

    #[test]
    fn garbage_operation_fails_without_panicking() {
        let mut sm = state_machine();
        let mut ctx = ApplyContext::new(RaftGroupId::new("cp", 0), Index::new(1), 0);

        let outcome = sm.apply(&mut ctx, &[0xff, 0xff, 0xff, 0xff]);

        assert!(matches!(outcome, OpOutcome::Failed(RaftError::Internal(_))));
    }
}
