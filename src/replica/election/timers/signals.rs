use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// SharedOption is a single slot shared between a timer handle and its task.
#[derive(Clone)]
pub(super) struct SharedOption<T> {
    data: Arc<Mutex<Option<T>>>,
}

impl<T> SharedOption<T> {
    pub(super) fn new() -> Self {
        SharedOption {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn replace(&self, new_data: T) {
        // Nothing panics while holding the lock, so a poisoned slot still holds valid data.
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        guard.replace(new_data);
    }

    pub(super) fn take(&self) -> Option<T> {
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

/// Stopper flips its paired StopCheck when dropped.
pub(super) struct Stopper {
    stop_signal: Arc<AtomicBool>,
}

pub(super) struct StopCheck {
    stop_signal: Arc<AtomicBool>,
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Release);
    }
}

impl StopCheck {
    pub(super) fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::Acquire)
    }
}

pub(super) fn stop_signal() -> (Stopper, StopCheck) {
    let stop_signal = Arc::new(AtomicBool::new(false));

    (
        Stopper {
            stop_signal: stop_signal.clone(),
        },
        StopCheck { stop_signal },
    )
}
