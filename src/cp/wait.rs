use crate::commitlog::Index;
use crate::invocation::InvocationUid;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// WaitKey is a parked request. Its `commit_index` is the index of the entry that parked it, and
/// the caller waiting on that entry is completed through `ApplyContext::complete`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WaitKey<T> {
    pub(crate) commit_index: Index,
    pub(crate) session_id: Option<u64>,
    pub(crate) invocation_uid: InvocationUid,
    // Leader timestamp after which the wait gives up. None waits forever.
    pub(crate) deadline_millis: Option<i64>,
    pub(crate) request: T,
}

/// WaitQueue holds the wait keys of one resource in arrival order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct WaitQueue<T> {
    keys: VecDeque<WaitKey<T>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        WaitQueue { keys: VecDeque::new() }
    }
}

impl<T> WaitQueue<T> {
    pub(crate) fn push(&mut self, key: WaitKey<T>) {
        self.keys.push_back(key);
    }

    /// A retry of an already parked request re-targets its wait key to the retry's entry, since
    /// only that entry has a caller waiting on it. Returns the entry the key was parked on, if the
    /// request was parked.
    pub(crate) fn retarget(&mut self, invocation_uid: InvocationUid, commit_index: Index) -> Option<Index> {
        self.keys
            .iter_mut()
            .find(|key| key.invocation_uid == invocation_uid)
            .map(|key| std::mem::replace(&mut key.commit_index, commit_index))
    }

    pub(crate) fn pop_front(&mut self) -> Option<WaitKey<T>> {
        self.keys.pop_front()
    }

    /// Removes, in arrival order, every key `grant` accepts. `grant` sees keys in FIFO order and
    /// can consume the resource, so later keys only get what earlier ones left.
    pub(crate) fn take_granted<F>(&mut self, mut grant: F) -> Vec<WaitKey<T>>
    where
        F: FnMut(&WaitKey<T>) -> bool,
    {
        let mut granted = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.keys.len());
        for key in self.keys.drain(..) {
            if grant(&key) {
                granted.push(key);
            } else {
                remaining.push_back(key);
            }
        }
        self.keys = remaining;

        granted
    }

    pub(crate) fn take_session(&mut self, session_id: u64) -> Vec<WaitKey<T>> {
        self.take_granted(|key| key.session_id == Some(session_id))
    }

    pub(crate) fn take_expired(&mut self, now_millis: i64) -> Vec<WaitKey<T>> {
        self.take_granted(|key| matches!(key.deadline_millis, Some(deadline) if deadline <= now_millis))
    }

    pub(crate) fn take_all(&mut self) -> Vec<WaitKey<T>> {
        self.keys.drain(..).collect()
    }

    pub(crate) fn has_expired(&self, now_millis: i64) -> bool {
        self.keys
            .iter()
            .any(|key| matches!(key.deadline_millis, Some(deadline) if deadline <= now_millis))
    }
}

/// Deadline of a wait that started at `now_millis`. Callers answer non-positive timeouts right
/// away instead of parking.
pub(crate) fn deadline(now_millis: i64, timeout_millis: Option<i64>) -> Option<i64> {
    timeout_millis.map(|timeout| now_millis.saturating_add(timeout.max(0)))
}
