mod atomic;
mod cp_client;
mod latch;
mod lock;
mod semaphore;
mod session_manager;

pub use atomic::AtomicLongProxy;
pub use atomic::AtomicRefProxy;
pub use cp_client::CpClient;
pub use cp_client::CpClientConfig;
pub use latch::CountDownLatchProxy;
pub use lock::FencedLockProxy;
pub use semaphore::SemaphoreProxy;
pub use session_manager::ClientSessionManager;

use tokio::time::Instant;

// Timeout left for a blocking call that is re-sent after the invocation deadline, so the wait
// still ends at the caller's original deadline.
fn remaining_millis(deadline: Instant) -> i64 {
    deadline.saturating_duration_since(Instant::now()).as_millis() as i64
}
