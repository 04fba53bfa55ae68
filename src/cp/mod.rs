mod atomic;
mod latch;
mod lock;
mod op;
mod semaphore;
mod service;
mod session;
mod state_machine;
mod wait;

pub use atomic::AtomicLongOp;
pub use atomic::AtomicRefOp;
pub use latch::LatchOp;
pub use lock::LockEndpoint;
pub use lock::LockOp;
pub use lock::LockOwnershipState;
pub use lock::INVALID_FENCE;
pub use op::CpOp;
pub use semaphore::SemaphoreOp;
pub use session::CpSession;
pub use session::SessionOp;
pub use session::SessionResponse;
pub use state_machine::CpStateMachine;
