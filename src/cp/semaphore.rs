use crate::api::{self, RaftError};
use crate::cp::service::{self, BlockingService};
use crate::cp::wait::{self, WaitKey, WaitQueue};
use crate::invocation::InvocationUid;
use crate::replica::{ApplyContext, OpOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semaphore operations. Permits are accounted per session, so a crashed client's permits come
/// back when its session closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemaphoreOp {
    /// Replies false if already initialized.
    Init { name: String, permits: i64 },
    /// Replies true once acquired. `timeout_millis` of None waits forever, zero doesn't wait.
    Acquire {
        name: String,
        session_id: u64,
        thread_id: u64,
        invocation_uid: InvocationUid,
        permits: i64,
        timeout_millis: Option<i64>,
    },
    Release {
        name: String,
        session_id: u64,
        thread_id: u64,
        invocation_uid: InvocationUid,
        permits: i64,
    },
    /// Acquires every available permit. Replies with how many.
    Drain {
        name: String,
        session_id: u64,
        thread_id: u64,
        invocation_uid: InvocationUid,
    },
    /// Adds `delta` permits, which may be negative.
    Change {
        name: String,
        session_id: u64,
        thread_id: u64,
        invocation_uid: InvocationUid,
        delta: i64,
    },
    AvailablePermits { name: String },
    Destroy { name: String },
}

impl SemaphoreOp {
    pub(crate) fn session_id(&self) -> Option<u64> {
        match self {
            SemaphoreOp::Acquire { session_id, .. }
            | SemaphoreOp::Release { session_id, .. }
            | SemaphoreOp::Drain { session_id, .. }
            | SemaphoreOp::Change { session_id, .. } => Some(*session_id),
            SemaphoreOp::Init { .. } | SemaphoreOp::AvailablePermits { .. } | SemaphoreOp::Destroy { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct AcquireRequest {
    thread_id: u64,
    permits: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionPermits {
    acquired: i64,
    // Latest reply per thread, replayed to a retry of that call. A thread's calls are
    // sequential, so older replies are never asked for again.
    invocation_results: BTreeMap<u64, (InvocationUid, Vec<u8>)>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CpSemaphore {
    initialized: bool,
    available: i64,
    sessions: BTreeMap<u64, SessionPermits>,
    waiters: WaitQueue<AcquireRequest>,
}

impl CpSemaphore {
    fn replay(&self, session_id: u64, thread_id: u64, invocation_uid: InvocationUid) -> Option<Vec<u8>> {
        self.sessions
            .get(&session_id)
            .and_then(|s| s.invocation_results.get(&thread_id))
            .filter(|(uid, _)| *uid == invocation_uid)
            .map(|(_, reply)| reply.clone())
    }

    fn record<T: Serialize>(
        &mut self,
        session_id: u64,
        thread_id: u64,
        invocation_uid: InvocationUid,
        value: &T,
    ) -> OpOutcome {
        match api::encode(value) {
            Ok(reply) => {
                self.sessions
                    .entry(session_id)
                    .or_default()
                    .invocation_results
                    .insert(thread_id, (invocation_uid, reply.clone()));
                OpOutcome::Applied(reply)
            }
            Err(e) => OpOutcome::Failed(e),
        }
    }

    fn take_permits(&mut self, session_id: u64, permits: i64) {
        self.available -= permits;
        self.sessions.entry(session_id).or_default().acquired += permits;
    }

    /// Grants waiters in arrival order while permits last. A waiter asking for more than what's
    /// left doesn't block smaller requests behind it.
    fn grant_waiters(&mut self, ctx: &mut ApplyContext) {
        let mut available = self.available;
        let granted = self.waiters.take_granted(|key| {
            if key.request.permits <= available {
                available -= key.request.permits;
                true
            } else {
                false
            }
        });

        for key in granted {
            if let Some(session_id) = key.session_id {
                self.take_permits(session_id, key.request.permits);
                let _ = self.record(session_id, key.request.thread_id, key.invocation_uid, &true);
            }
            service::complete(ctx, key.commit_index, &true);
        }
    }
}

/// SemaphoreRegistry holds the semaphores of one group.
#[derive(Default)]
pub(crate) struct SemaphoreRegistry {
    semaphores: BTreeMap<String, CpSemaphore>,
}

impl SemaphoreRegistry {
    pub(crate) fn apply(&mut self, ctx: &mut ApplyContext, op: SemaphoreOp) -> OpOutcome {
        match op {
            SemaphoreOp::Init { name, permits } => {
                if permits < 0 {
                    return OpOutcome::Failed(RaftError::IllegalArgument(format!(
                        "Permits must not be negative: {}",
                        permits
                    )));
                }
                let semaphore = self.semaphores.entry(name).or_default();
                if semaphore.initialized {
                    return service::applied(&false);
                }
                semaphore.initialized = true;
                semaphore.available += permits;
                semaphore.grant_waiters(ctx);
                service::applied(&true)
            }
            SemaphoreOp::Acquire {
                name,
                session_id,
                thread_id,
                invocation_uid,
                permits,
                timeout_millis,
            } => {
                if permits <= 0 {
                    return illegal_permits(permits);
                }
                let semaphore = self.semaphores.entry(name).or_default();
                if let Some(reply) = semaphore.replay(session_id, thread_id, invocation_uid) {
                    return OpOutcome::Applied(reply);
                }
                let index = ctx.commit_index();
                if let Some(parked) = semaphore.waiters.retarget(invocation_uid, index) {
                    service::supersede(ctx, parked, index);
                    return OpOutcome::Postponed;
                }
                if semaphore.available >= permits {
                    semaphore.take_permits(session_id, permits);
                    return semaphore.record(session_id, thread_id, invocation_uid, &true);
                }
                if matches!(timeout_millis, Some(timeout) if timeout <= 0) {
                    return service::applied(&false);
                }

                semaphore.waiters.push(WaitKey {
                    commit_index: ctx.commit_index(),
                    session_id: Some(session_id),
                    invocation_uid,
                    deadline_millis: wait::deadline(ctx.timestamp_millis(), timeout_millis),
                    request: AcquireRequest { thread_id, permits },
                });
                OpOutcome::Postponed
            }
            SemaphoreOp::Release {
                name,
                session_id,
                thread_id,
                invocation_uid,
                permits,
            } => {
                if permits <= 0 {
                    return illegal_permits(permits);
                }
                let semaphore = self.semaphores.entry(name.clone()).or_default();
                if let Some(reply) = semaphore.replay(session_id, thread_id, invocation_uid) {
                    return OpOutcome::Applied(reply);
                }
                let acquired = semaphore.sessions.get(&session_id).map(|s| s.acquired).unwrap_or(0);
                if acquired < permits {
                    return OpOutcome::Failed(RaftError::IllegalArgument(format!(
                        "Session {} holds {} permits of semaphore {}, can't release {}",
                        session_id, acquired, name, permits
                    )));
                }

                semaphore.available += permits;
                semaphore.sessions.entry(session_id).or_default().acquired -= permits;
                let outcome = semaphore.record(session_id, thread_id, invocation_uid, &());
                semaphore.grant_waiters(ctx);
                outcome
            }
            SemaphoreOp::Drain {
                name,
                session_id,
                thread_id,
                invocation_uid,
            } => {
                let semaphore = self.semaphores.entry(name).or_default();
                if let Some(reply) = semaphore.replay(session_id, thread_id, invocation_uid) {
                    return OpOutcome::Applied(reply);
                }
                let drained = semaphore.available.max(0);
                semaphore.take_permits(session_id, drained);
                semaphore.record(session_id, thread_id, invocation_uid, &drained)
            }
            SemaphoreOp::Change {
                name,
                session_id,
                thread_id,
                invocation_uid,
                delta,
            } => {
                let semaphore = self.semaphores.entry(name).or_default();
                if let Some(reply) = semaphore.replay(session_id, thread_id, invocation_uid) {
                    return OpOutcome::Applied(reply);
                }
                semaphore.initialized = true;
                semaphore.available += delta;
                let outcome = semaphore.record(session_id, thread_id, invocation_uid, &true);
                if delta > 0 {
                    semaphore.grant_waiters(ctx);
                }
                outcome
            }
            SemaphoreOp::AvailablePermits { name } => {
                let available = self.semaphores.get(&name).map(|s| s.available).unwrap_or(0);
                service::applied(&available)
            }
            SemaphoreOp::Destroy { name } => {
                let destroyed = match self.semaphores.remove(&name) {
                    Some(mut semaphore) => {
                        for key in semaphore.waiters.take_all() {
                            service::cancel(ctx, key.commit_index, "Semaphore is destroyed");
                        }
                        true
                    }
                    None => false,
                };
                service::applied(&destroyed)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        api::encode(&self.semaphores)
    }

    pub(crate) fn restore(&mut self, snapshot: &[u8]) -> Result<(), RaftError> {
        self.semaphores = api::decode(snapshot)?;
        Ok(())
    }
}

fn illegal_permits(permits: i64) -> OpOutcome {
    OpOutcome::Failed(RaftError::IllegalArgument(format!(
        "Permits must be positive: {}",
        permits
    )))
}

impl BlockingService for SemaphoreRegistry {
    fn on_session_closed(&mut self, ctx: &mut ApplyContext, session_id: u64) {
        for semaphore in self.semaphores.values_mut() {
            for key in semaphore.waiters.take_session(session_id) {
                service::cancel(ctx, key.commit_index, "Session is closed");
            }
            if let Some(permits) = semaphore.sessions.remove(&session_id) {
                if permits.acquired > 0 {
                    semaphore.available += permits.acquired;
                    semaphore.grant_waiters(ctx);
                }
            }
        }
    }

    fn expire_wait_keys(&mut self, ctx: &mut ApplyContext) {
        let now = ctx.timestamp_millis();
        for semaphore in self.semaphores.values_mut() {
            for key in semaphore.waiters.take_expired(now) {
                service::complete(ctx, key.commit_index, &false);
            }
        }
    }

    fn has_expired_wait_keys(&self, now_millis: i64) -> bool {
        self.semaphores.values().any(|s| s.waiters.has_expired(now_millis))
    }

    fn cancel_all_wait_keys(&mut self, ctx: &mut ApplyContext) {
        for semaphore in self.semaphores.values_mut() {
            for key in semaphore.waiters.take_all() {
                service::cancel(ctx, key.commit_index, "Group is terminated");
            }
        }
    }
}
