use serde::{Deserialize, Serialize};
use std::fmt;

/// InvocationUid is generated once per logical client call and reused across every retry of
/// that call, letting replicated services recognize a retry of an already applied operation.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvocationUid(u128);

impl InvocationUid {
    pub fn new_random() -> Self {
        InvocationUid(rand::random())
    }

    pub fn from_u128(uid: u128) -> Self {
        InvocationUid(uid)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Debug for InvocationUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
