use crate::api::RaftError;
use crate::client::{remaining_millis, ClientSessionManager};
use crate::cp::{CpOp, SemaphoreOp};
use crate::invocation::{InvocationPolicy, InvocationUid, RaftInvocationManager};
use crate::replica::RaftGroupId;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// SemaphoreProxy is a handle to a session-bound counting semaphore. Permits held by this client
/// return to the semaphore if its session expires.
#[derive(Clone)]
pub struct SemaphoreProxy {
    group_id: RaftGroupId,
    name: String,
    invocation: Arc<RaftInvocationManager>,
    sessions: Arc<ClientSessionManager>,
}

impl SemaphoreProxy {
    pub(crate) fn new(
        group_id: RaftGroupId,
        name: String,
        invocation: Arc<RaftInvocationManager>,
        sessions: Arc<ClientSessionManager>,
    ) -> Self {
        SemaphoreProxy {
            group_id,
            name,
            invocation,
            sessions,
        }
    }

    /// Returns false if the semaphore was already initialized.
    pub async fn init(&self, permits: i64) -> Result<bool, RaftError> {
        let op = CpOp::Semaphore(SemaphoreOp::Init {
            name: self.name.clone(),
            permits,
        });
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::idempotent())
            .await
    }

    pub async fn acquire(&self, permits: i64) -> Result<(), RaftError> {
        self.do_acquire(permits, None).await.map(|_| ())
    }

    pub async fn try_acquire(&self, permits: i64, timeout: Duration) -> Result<bool, RaftError> {
        self.do_acquire(permits, Some(Instant::now() + timeout)).await
    }

    pub async fn release(&self, permits: i64) -> Result<(), RaftError> {
        let session_id = self
            .sessions
            .session_id(&self.group_id)
            .ok_or_else(|| RaftError::IllegalArgument(format!("No permits of {} are held", self.name)))?;
        let uid = InvocationUid::new_random();

        let result: Result<(), RaftError> = self
            .invoke_bound(session_id, |session_id, thread_id| SemaphoreOp::Release {
                name: self.name.clone(),
                session_id,
                thread_id,
                invocation_uid: uid,
                permits,
            })
            .await;
        match result {
            Ok(()) => {
                self.sessions.release_session(&self.group_id, session_id, permits);
                Ok(())
            }
            Err(RaftError::SessionExpired { .. }) => {
                self.sessions.invalidate_session(&self.group_id, session_id);
                Err(RaftError::IllegalArgument(format!(
                    "Session {} holding permits of {} expired",
                    session_id, self.name
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Acquires every available permit and returns how many.
    pub async fn drain(&self) -> Result<i64, RaftError> {
        let uid = InvocationUid::new_random();
        loop {
            let session_id = self.sessions.acquire_session(&self.group_id, 1).await?;
            let result: Result<i64, RaftError> = self
                .invoke_bound(session_id, |session_id, thread_id| SemaphoreOp::Drain {
                    name: self.name.clone(),
                    session_id,
                    thread_id,
                    invocation_uid: uid,
                })
                .await;
            match result {
                Ok(drained) => {
                    // The session is now acquired once per drained permit.
                    self.sessions.release_session(&self.group_id, session_id, 1 - drained);
                    return Ok(drained);
                }
                Err(RaftError::SessionExpired { .. }) => self.sessions.invalidate_session(&self.group_id, session_id),
                Err(e) => {
                    self.sessions.release_session(&self.group_id, session_id, 1);
                    return Err(e);
                }
            }
        }
    }

    pub async fn increase_permits(&self, delta: i64) -> Result<(), RaftError> {
        self.change(delta).await
    }

    pub async fn reduce_permits(&self, delta: i64) -> Result<(), RaftError> {
        self.change(-delta).await
    }

    pub async fn available_permits(&self) -> Result<i64, RaftError> {
        let op = CpOp::Semaphore(SemaphoreOp::AvailablePermits { name: self.name.clone() });
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::idempotent())
            .await
    }

    pub async fn destroy(&self) -> Result<bool, RaftError> {
        let op = CpOp::Semaphore(SemaphoreOp::Destroy { name: self.name.clone() });
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::non_idempotent())
            .await
    }

    // None waits forever.
    async fn do_acquire(&self, permits: i64, deadline: Option<Instant>) -> Result<bool, RaftError> {
        let uid = InvocationUid::new_random();
        let thread_id = self.sessions.thread_id(&self.group_id).await?;
        loop {
            let session_id = self.sessions.acquire_session(&self.group_id, permits).await?;
            let result: Result<bool, RaftError> = self
                .invocation
                .invoke_cp_blocking(&self.group_id, || {
                    CpOp::Semaphore(SemaphoreOp::Acquire {
                        name: self.name.clone(),
                        session_id,
                        thread_id,
                        invocation_uid: uid,
                        permits,
                        timeout_millis: deadline.map(remaining_millis),
                    })
                })
                .await;
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    self.sessions.release_session(&self.group_id, session_id, permits);
                    return Ok(false);
                }
                Err(RaftError::SessionExpired { .. }) => self.sessions.invalidate_session(&self.group_id, session_id),
                Err(e) => {
                    self.sessions.release_session(&self.group_id, session_id, permits);
                    return Err(e);
                }
            }
        }
    }

    async fn change(&self, delta: i64) -> Result<(), RaftError> {
        let uid = InvocationUid::new_random();
        loop {
            let session_id = self.sessions.acquire_session(&self.group_id, 1).await?;
            let result: Result<bool, RaftError> = self
                .invoke_bound(session_id, |session_id, thread_id| SemaphoreOp::Change {
                    name: self.name.clone(),
                    session_id,
                    thread_id,
                    invocation_uid: uid,
                    delta,
                })
                .await;
            self.sessions.release_session(&self.group_id, session_id, 1);
            match result {
                Ok(_) => return Ok(()),
                Err(RaftError::SessionExpired { .. }) => self.sessions.invalidate_session(&self.group_id, session_id),
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_bound<T, F>(&self, session_id: u64, build: F) -> Result<T, RaftError>
    where
        T: DeserializeOwned,
        F: FnOnce(u64, u64) -> SemaphoreOp,
    {
        let thread_id = self.sessions.thread_id(&self.group_id).await?;
        let op = CpOp::Semaphore(build(session_id, thread_id));
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::idempotent())
            .await
    }
}
