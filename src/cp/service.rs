use crate::api::{self, RaftError};
use crate::commitlog::Index;
use crate::replica::{ApplyContext, OpOutcome};
use serde::Serialize;

/// BlockingService is implemented by every service that parks wait keys. The state machine calls
/// these hooks while applying the committed entries that trigger them.
pub(crate) trait BlockingService {
    /// Releases what the session held and cancels its wait keys.
    fn on_session_closed(&mut self, ctx: &mut ApplyContext, session_id: u64);

    /// Completes the wait keys whose deadline passed at the entry's timestamp with the
    /// resource's negative answer.
    fn expire_wait_keys(&mut self, ctx: &mut ApplyContext);

    fn has_expired_wait_keys(&self, now_millis: i64) -> bool;

    /// Cancels every wait key, e.g. on group termination.
    fn cancel_all_wait_keys(&mut self, ctx: &mut ApplyContext);
}

pub(crate) fn applied<T: Serialize>(value: &T) -> OpOutcome {
    match api::encode(value) {
        Ok(bytes) => OpOutcome::Applied(bytes),
        Err(e) => OpOutcome::Failed(e),
    }
}

pub(crate) fn complete<T: Serialize>(ctx: &mut ApplyContext, index: Index, value: &T) {
    ctx.complete(index, api::encode(value));
}

pub(crate) fn cancel(ctx: &mut ApplyContext, index: Index, reason: &str) {
    ctx.complete(index, Err(RaftError::WaitKeyCancelled(reason.to_string())));
}

/// Fails the caller of a parked request whose retry took over its wait key at `retry_index`.
pub(crate) fn supersede(ctx: &mut ApplyContext, index: Index, retry_index: Index) {
    ctx.complete(
        index,
        Err(RaftError::IndeterminateOperationState(format!(
            "Wait moved to the retry at {:?}",
            retry_index
        ))),
    );
}
