use crate::cp::atomic::{AtomicLongOp, AtomicRefOp};
use crate::cp::latch::LatchOp;
use crate::cp::lock::LockOp;
use crate::cp::semaphore::SemaphoreOp;
use crate::cp::session::SessionOp;
use serde::{Deserialize, Serialize};

/// CpOp is the closed set of operations replicated by a CP group. Encoded with bincode, so the
/// variant order here and in every nested op enum is the wire tag. Append new variants only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpOp {
    Session(SessionOp),
    Lock(LockOp),
    Semaphore(SemaphoreOp),
    Latch(LatchOp),
    AtomicLong(AtomicLongOp),
    AtomicRef(AtomicRefOp),
    /// Proposed by the leader when a wait key's deadline has passed.
    ExpireWaitKeys,
}

impl CpOp {
    /// The session an operation is bound to. Bound operations fail once the session is gone,
    /// and otherwise extend its lease.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            CpOp::Lock(op) => op.session_id(),
            CpOp::Semaphore(op) => op.session_id(),
            CpOp::Session(_) | CpOp::Latch(_) | CpOp::AtomicLong(_) | CpOp::AtomicRef(_) | CpOp::ExpireWaitKeys => {
                None
            }
        }
    }
}
