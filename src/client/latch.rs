use crate::api::RaftError;
use crate::client::remaining_millis;
use crate::cp::{CpOp, LatchOp};
use crate::invocation::{InvocationPolicy, InvocationUid, RaftInvocationManager};
use crate::replica::RaftGroupId;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// CountDownLatchProxy is a handle to a count-down latch. Latches aren't bound to sessions.
#[derive(Clone)]
pub struct CountDownLatchProxy {
    group_id: RaftGroupId,
    name: String,
    invocation: Arc<RaftInvocationManager>,
}

impl CountDownLatchProxy {
    pub(crate) fn new(group_id: RaftGroupId, name: String, invocation: Arc<RaftInvocationManager>) -> Self {
        CountDownLatchProxy {
            group_id,
            name,
            invocation,
        }
    }

    /// Starts a new round. Returns false while the current round is still counting down.
    pub async fn try_set_count(&self, count: u32) -> Result<bool, RaftError> {
        self.invoke(
            LatchOp::TrySetCount {
                name: self.name.clone(),
                count,
            },
            InvocationPolicy::non_idempotent(),
        )
        .await
    }

    pub async fn count_down(&self) -> Result<u32, RaftError> {
        let expected_round = self.round().await?;
        self.invoke(
            LatchOp::CountDown {
                name: self.name.clone(),
                invocation_uid: InvocationUid::new_random(),
                expected_round,
            },
            InvocationPolicy::idempotent(),
        )
        .await
    }

    pub async fn count(&self) -> Result<u32, RaftError> {
        self.invoke(LatchOp::GetCount { name: self.name.clone() }, InvocationPolicy::idempotent())
            .await
    }

    pub async fn round(&self) -> Result<u32, RaftError> {
        self.invoke(LatchOp::GetRound { name: self.name.clone() }, InvocationPolicy::idempotent())
            .await
    }

    /// Returns false if the count didn't reach zero within `timeout`. None waits forever.
    pub async fn await_zero(&self, timeout: Option<Duration>) -> Result<bool, RaftError> {
        let uid = InvocationUid::new_random();
        let deadline = timeout.map(|t| Instant::now() + t);
        self.invocation
            .invoke_cp_blocking(&self.group_id, || {
                CpOp::Latch(LatchOp::Await {
                    name: self.name.clone(),
                    invocation_uid: uid,
                    timeout_millis: deadline.map(remaining_millis),
                })
            })
            .await
    }

    pub async fn destroy(&self) -> Result<bool, RaftError> {
        self.invoke(LatchOp::Destroy { name: self.name.clone() }, InvocationPolicy::non_idempotent())
            .await
    }

    async fn invoke<T: serde::de::DeserializeOwned>(
        &self,
        op: LatchOp,
        policy: InvocationPolicy,
    ) -> Result<T, RaftError> {
        self.invocation.invoke_cp(&self.group_id, &CpOp::Latch(op), policy).await
    }
}
