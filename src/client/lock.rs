use crate::api::RaftError;
use crate::client::{remaining_millis, ClientSessionManager};
use crate::cp::{CpOp, LockEndpoint, LockOp, LockOwnershipState, INVALID_FENCE};
use crate::invocation::{InvocationPolicy, InvocationUid, RaftInvocationManager};
use crate::replica::RaftGroupId;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// FencedLockProxy is a handle to a reentrant, session-bound lock. Every successful acquisition
/// returns a fence that only grows across owners, for use as a token towards external services.
///
/// The holder is this client's thread id within the lock's group, so all handles from the same
/// client share ownership.
#[derive(Clone)]
pub struct FencedLockProxy {
    group_id: RaftGroupId,
    name: String,
    invocation: Arc<RaftInvocationManager>,
    sessions: Arc<ClientSessionManager>,
}

impl FencedLockProxy {
    pub(crate) fn new(
        group_id: RaftGroupId,
        name: String,
        invocation: Arc<RaftInvocationManager>,
        sessions: Arc<ClientSessionManager>,
    ) -> Self {
        FencedLockProxy {
            group_id,
            name,
            invocation,
            sessions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until the lock is acquired and returns the fence.
    pub async fn lock(&self) -> Result<u64, RaftError> {
        let uid = InvocationUid::new_random();
        self.acquire(|endpoint| LockOp::Lock {
            name: self.name.clone(),
            endpoint,
            invocation_uid: uid,
        })
        .await
    }

    /// Returns `INVALID_FENCE` if the lock isn't acquired within `timeout`.
    pub async fn try_lock(&self, timeout: Duration) -> Result<u64, RaftError> {
        let uid = InvocationUid::new_random();
        let deadline = Instant::now() + timeout;
        self.acquire(|endpoint| LockOp::TryLock {
            name: self.name.clone(),
            endpoint,
            invocation_uid: uid,
            timeout_millis: remaining_millis(deadline),
        })
        .await
    }

    pub async fn unlock(&self) -> Result<(), RaftError> {
        let session_id = self
            .sessions
            .session_id(&self.group_id)
            .ok_or_else(|| RaftError::IllegalMonitorState(format!("Lock {} is not held", self.name)))?;
        let thread_id = self.sessions.thread_id(&self.group_id).await?;

        let op = CpOp::Lock(LockOp::Unlock {
            name: self.name.clone(),
            endpoint: LockEndpoint { session_id, thread_id },
            invocation_uid: InvocationUid::new_random(),
        });
        let result: Result<u32, RaftError> = self
            .invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::idempotent())
            .await;

        match result {
            Ok(_) => {
                self.sessions.release_session(&self.group_id, session_id, 1);
                Ok(())
            }
            Err(RaftError::SessionExpired { .. }) => {
                // The lock went away with the session.
                self.sessions.invalidate_session(&self.group_id, session_id);
                Err(RaftError::IllegalMonitorState(format!(
                    "Session {} of lock {} expired",
                    session_id, self.name
                )))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ownership_state(&self) -> Result<LockOwnershipState, RaftError> {
        let op = CpOp::Lock(LockOp::GetLockOwnershipState { name: self.name.clone() });
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::idempotent())
            .await
    }

    pub async fn is_locked(&self) -> Result<bool, RaftError> {
        Ok(self.ownership_state().await?.is_locked())
    }

    pub async fn is_locked_by_me(&self) -> Result<bool, RaftError> {
        let state = self.ownership_state().await?;
        let thread_id = self.sessions.thread_id(&self.group_id).await?;
        match self.sessions.session_id(&self.group_id) {
            Some(session_id) => Ok(state.is_locked_by(&LockEndpoint { session_id, thread_id })),
            None => Ok(false),
        }
    }

    pub async fn destroy(&self) -> Result<bool, RaftError> {
        let op = CpOp::Lock(LockOp::Destroy { name: self.name.clone() });
        self.invocation
            .invoke_cp(&self.group_id, &op, InvocationPolicy::non_idempotent())
            .await
    }

    // Acquisitions keep the session acquired until the matching unlock, including while a wait
    // is re-sent past the invocation timeout. An expired session is replaced and the acquisition
    // retried under the new one.
    async fn acquire<F>(&self, build: F) -> Result<u64, RaftError>
    where
        F: Fn(LockEndpoint) -> LockOp,
    {
        let thread_id = self.sessions.thread_id(&self.group_id).await?;

        loop {
            let session_id = self.sessions.acquire_session(&self.group_id, 1).await?;
            let endpoint = LockEndpoint { session_id, thread_id };
            let result: Result<u64, RaftError> = self
                .invocation
                .invoke_cp_blocking(&self.group_id, || CpOp::Lock(build(endpoint)))
                .await;

            match result {
                Ok(INVALID_FENCE) => {
                    self.sessions.release_session(&self.group_id, session_id, 1);
                    return Ok(INVALID_FENCE);
                }
                Ok(fence) => return Ok(fence),
                Err(RaftError::SessionExpired { .. }) => {
                    self.sessions.invalidate_session(&self.group_id, session_id);
                }
                Err(e) => {
                    self.sessions.release_session(&self.group_id, session_id, 1);
                    return Err(e);
                }
            }
        }
    }
}
