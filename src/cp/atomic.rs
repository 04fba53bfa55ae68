use crate::api::{self, RaftError};
use crate::cp::service;
use crate::replica::OpOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicLongOp {
    Get { name: String },
    Set { name: String, value: i64 },
    GetAndSet { name: String, value: i64 },
    AddAndGet { name: String, delta: i64 },
    GetAndAdd { name: String, delta: i64 },
    CompareAndSet { name: String, expect: i64, update: i64 },
    Destroy { name: String },
}

/// AtomicLongRegistry holds the atomic longs of one group. Unknown names read as zero.
#[derive(Default)]
pub(crate) struct AtomicLongRegistry {
    values: BTreeMap<String, i64>,
}

impl AtomicLongRegistry {
    pub(crate) fn apply(&mut self, op: AtomicLongOp) -> OpOutcome {
        match op {
            AtomicLongOp::Get { name } => service::applied(&self.values.get(&name).copied().unwrap_or(0)),
            AtomicLongOp::Set { name, value } => {
                self.values.insert(name, value);
                service::applied(&())
            }
            AtomicLongOp::GetAndSet { name, value } => {
                let previous = self.values.insert(name, value).unwrap_or(0);
                service::applied(&previous)
            }
            AtomicLongOp::AddAndGet { name, delta } => {
                let value = self.values.entry(name).or_insert(0);
                *value = value.wrapping_add(delta);
                service::applied(&*value)
            }
            AtomicLongOp::GetAndAdd { name, delta } => {
                let value = self.values.entry(name).or_insert(0);
                let previous = *value;
                *value = value.wrapping_add(delta);
                service::applied(&previous)
            }
            AtomicLongOp::CompareAndSet { name, expect, update } => {
                let value = self.values.entry(name).or_insert(0);
                let swapped = *value == expect;
                if swapped {
                    *value = update;
                }
                service::applied(&swapped)
            }
            AtomicLongOp::Destroy { name } => service::applied(&self.values.remove(&name).is_some()),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        api::encode(&self.values)
    }

    pub(crate) fn restore(&mut self, snapshot: &[u8]) -> Result<(), RaftError> {
        self.values = api::decode(snapshot)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicRefOp {
    Get {
        name: String,
    },
    Set {
        name: String,
        value: Option<Vec<u8>>,
    },
    GetAndSet {
        name: String,
        value: Option<Vec<u8>>,
    },
    CompareAndSet {
        name: String,
        expect: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
    },
    /// `Contains { value: None }` is the null check.
    Contains {
        name: String,
        value: Option<Vec<u8>>,
    },
    Destroy {
        name: String,
    },
}

/// AtomicRefRegistry holds the atomic references of one group. Values are opaque bytes and
/// compared byte for byte. Unknown names read as null.
#[derive(Default)]
pub(crate) struct AtomicRefRegistry {
    values: BTreeMap<String, Vec<u8>>,
}

impl AtomicRefRegistry {
    pub(crate) fn apply(&mut self, op: AtomicRefOp) -> OpOutcome {
        match op {
            AtomicRefOp::Get { name } => service::applied(&self.values.get(&name)),
            AtomicRefOp::Set { name, value } => {
                self.set(name, value);
                service::applied(&())
            }
            AtomicRefOp::GetAndSet { name, value } => {
                let previous = self.set(name, value);
                service::applied(&previous)
            }
            AtomicRefOp::CompareAndSet { name, expect, update } => {
                let swapped = self.values.get(&name) == expect.as_ref();
                if swapped {
                    self.set(name, update);
                }
                service::applied(&swapped)
            }
            AtomicRefOp::Contains { name, value } => service::applied(&(self.values.get(&name) == value.as_ref())),
            AtomicRefOp::Destroy { name } => service::applied(&self.values.remove(&name).is_some()),
        }
    }

    fn set(&mut self, name: String, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        match value {
            Some(value) => self.values.insert(name, value),
            None => self.values.remove(&name),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        api::encode(&self.values)
    }

    pub(crate) fn restore(&mut self, snapshot: &[u8]) -> Result<(), RaftError> {
        self.values = api::decode(snapshot)?;
        Ok(())
    }
}
