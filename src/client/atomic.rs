use crate::api::RaftError;
use crate::cp::{AtomicLongOp, AtomicRefOp, CpOp};
use crate::invocation::{InvocationPolicy, RaftInvocationManager};
use crate::replica::RaftGroupId;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// AtomicLongProxy is a handle to a linearizable 64-bit counter.
#[derive(Clone)]
pub struct AtomicLongProxy {
    group_id: RaftGroupId,
    name: String,
    invocation: Arc<RaftInvocationManager>,
}

impl AtomicLongProxy {
    pub(crate) fn new(group_id: RaftGroupId, name: String, invocation: Arc<RaftInvocationManager>) -> Self {
        AtomicLongProxy {
            group_id,
            name,
            invocation,
        }
    }

    pub async fn get(&self) -> Result<i64, RaftError> {
        self.invoke(AtomicLongOp::Get { name: self.name.clone() }, InvocationPolicy::idempotent())
            .await
    }

    pub async fn set(&self, value: i64) -> Result<(), RaftError> {
        let op = AtomicLongOp::Set {
            name: self.name.clone(),
            value,
        };
        self.invoke(op, InvocationPolicy::idempotent()).await
    }

    pub async fn get_and_set(&self, value: i64) -> Result<i64, RaftError> {
        let op = AtomicLongOp::GetAndSet {
            name: self.name.clone(),
            value,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64, RaftError> {
        let op = AtomicLongOp::AddAndGet {
            name: self.name.clone(),
            delta,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64, RaftError> {
        let op = AtomicLongOp::GetAndAdd {
            name: self.name.clone(),
            delta,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn increment_and_get(&self) -> Result<i64, RaftError> {
        self.add_and_get(1).await
    }

    pub async fn compare_and_set(&self, expect: i64, update: i64) -> Result<bool, RaftError> {
        let op = AtomicLongOp::CompareAndSet {
            name: self.name.clone(),
            expect,
            update,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn destroy(&self) -> Result<bool, RaftError> {
        self.invoke(AtomicLongOp::Destroy { name: self.name.clone() }, InvocationPolicy::non_idempotent())
            .await
    }

    async fn invoke<T: DeserializeOwned>(&self, op: AtomicLongOp, policy: InvocationPolicy) -> Result<T, RaftError> {
        self.invocation
            .invoke_cp(&self.group_id, &CpOp::AtomicLong(op), policy)
            .await
    }
}

/// AtomicRefProxy is a handle to a linearizable reference holding opaque bytes. `None` is null.
#[derive(Clone)]
pub struct AtomicRefProxy {
    group_id: RaftGroupId,
    name: String,
    invocation: Arc<RaftInvocationManager>,
}

impl AtomicRefProxy {
    pub(crate) fn new(group_id: RaftGroupId, name: String, invocation: Arc<RaftInvocationManager>) -> Self {
        AtomicRefProxy {
            group_id,
            name,
            invocation,
        }
    }

    pub async fn get(&self) -> Result<Option<Vec<u8>>, RaftError> {
        self.invoke(AtomicRefOp::Get { name: self.name.clone() }, InvocationPolicy::idempotent())
            .await
    }

    pub async fn set(&self, value: Option<Vec<u8>>) -> Result<(), RaftError> {
        let op = AtomicRefOp::Set {
            name: self.name.clone(),
            value,
        };
        self.invoke(op, InvocationPolicy::idempotent()).await
    }

    pub async fn get_and_set(&self, value: Option<Vec<u8>>) -> Result<Option<Vec<u8>>, RaftError> {
        let op = AtomicRefOp::GetAndSet {
            name: self.name.clone(),
            value,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn compare_and_set(&self, expect: Option<Vec<u8>>, update: Option<Vec<u8>>) -> Result<bool, RaftError> {
        let op = AtomicRefOp::CompareAndSet {
            name: self.name.clone(),
            expect,
            update,
        };
        self.invoke(op, InvocationPolicy::non_idempotent()).await
    }

    pub async fn contains(&self, value: Option<Vec<u8>>) -> Result<bool, RaftError> {
        let op = AtomicRefOp::Contains {
            name: self.name.clone(),
            value,
        };
        self.invoke(op, InvocationPolicy::idempotent()).await
    }

    pub async fn is_null(&self) -> Result<bool, RaftError> {
        self.contains(None).await
    }

    pub async fn destroy(&self) -> Result<bool, RaftError> {
        self.invoke(AtomicRefOp::Destroy { name: self.name.clone() }, InvocationPolicy::non_idempotent())
            .await
    }

    async fn invoke<T: DeserializeOwned>(&self, op: AtomicRefOp, policy: InvocationPolicy) -> Result<T, RaftError> {
        self.invocation
            .invoke_cp(&self.group_id, &CpOp::AtomicRef(op), policy)
            .await
    }
}
