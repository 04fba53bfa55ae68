use crate::api::{self, RaftError};
use crate::cp::service::{self, BlockingService};
use crate::cp::wait::{self, WaitKey, WaitQueue};
use crate::invocation::InvocationUid;
use crate::replica::{ApplyContext, OpOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatchOp {
    /// Starts a new round counting down from `count`. Replies false while the current round is
    /// still counting.
    TrySetCount { name: String, count: u32 },
    /// Replies with the remaining count. Counting down twice with the same uid counts once.
    CountDown {
        name: String,
        invocation_uid: InvocationUid,
        expected_round: u32,
    },
    GetCount { name: String },
    GetRound { name: String },
    /// Replies true once the count reaches zero, false if the timeout elapses first. None waits
    /// forever.
    Await {
        name: String,
        invocation_uid: InvocationUid,
        timeout_millis: Option<i64>,
    },
    Destroy { name: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CountDownLatch {
    round: u32,
    count_down_from: u32,
    count_downs: BTreeSet<InvocationUid>,
    waiters: WaitQueue<()>,
}

impl CountDownLatch {
    fn remaining(&self) -> u32 {
        self.count_down_from.saturating_sub(self.count_downs.len() as u32)
    }
}

/// LatchRegistry holds the count-down latches of one group.
#[derive(Default)]
pub(crate) struct LatchRegistry {
    latches: BTreeMap<String, CountDownLatch>,
}

impl LatchRegistry {
    pub(crate) fn apply(&mut self, ctx: &mut ApplyContext, op: LatchOp) -> OpOutcome {
        match op {
            LatchOp::TrySetCount { name, count } => {
                if count == 0 {
                    return OpOutcome::Failed(RaftError::IllegalArgument("Count must be positive".to_string()));
                }
                let latch = self.latches.entry(name).or_default();
                if latch.remaining() > 0 {
                    return service::applied(&false);
                }
                latch.round += 1;
                latch.count_down_from = count;
                latch.count_downs.clear();
                service::applied(&true)
            }
            LatchOp::CountDown {
                name,
                invocation_uid,
                expected_round,
            } => {
                let latch = self.latches.entry(name).or_default();
                if expected_round > latch.round {
                    return OpOutcome::Failed(RaftError::IllegalArgument(format!(
                        "Expected round {} is ahead of the current round {}",
                        expected_round, latch.round
                    )));
                }
                if expected_round < latch.round || latch.remaining() == 0 {
                    return service::applied(&latch.remaining());
                }

                latch.count_downs.insert(invocation_uid);
                let remaining = latch.remaining();
                if remaining == 0 {
                    for key in latch.waiters.take_all() {
                        service::complete(ctx, key.commit_index, &true);
                    }
                }
                service::applied(&remaining)
            }
            LatchOp::GetCount { name } => {
                let remaining = self.latches.get(&name).map(CountDownLatch::remaining).unwrap_or(0);
                service::applied(&remaining)
            }
            LatchOp::GetRound { name } => {
                let round = self.latches.get(&name).map(|latch| latch.round).unwrap_or(0);
                service::applied(&round)
            }
            LatchOp::Await {
                name,
                invocation_uid,
                timeout_millis,
            } => {
                let latch = self.latches.entry(name).or_default();
                if latch.remaining() == 0 {
                    return service::applied(&true);
                }
                let index = ctx.commit_index();
                if let Some(parked) = latch.waiters.retarget(invocation_uid, index) {
                    service::supersede(ctx, parked, index);
                    return OpOutcome::Postponed;
                }
                if matches!(timeout_millis, Some(timeout) if timeout <= 0) {
                    return service::applied(&false);
                }

                latch.waiters.push(WaitKey {
                    commit_index: ctx.commit_index(),
                    session_id: None,
                    invocation_uid,
                    deadline_millis: wait::deadline(ctx.timestamp_millis(), timeout_millis),
                    request: (),
                });
                OpOutcome::Postponed
            }
            LatchOp::Destroy { name } => {
                let destroyed = match self.latches.remove(&name) {
                    Some(mut latch) => {
                        for key in latch.waiters.take_all() {
                            service::cancel(ctx, key.commit_index, "Count-down latch is destroyed");
                        }
                        true
                    }
                    None => false,
                };
                service::applied(&destroyed)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        api::encode(&self.latches)
    }

    pub(crate) fn restore(&mut self, snapshot: &[u8]) -> Result<(), RaftError> {
        self.latches = api::decode(snapshot)?;
        Ok(())
    }
}

impl BlockingService for LatchRegistry {
    // Awaiting a latch isn't bound to a session.
    fn on_session_closed(&mut self, _ctx: &mut ApplyContext, _session_id: u64) {}

    fn expire_wait_keys(&mut self, ctx: &mut ApplyContext) {
        let now = ctx.timestamp_millis();
        for latch in self.latches.values_mut() {
            for key in latch.waiters.take_expired(now) {
                service::complete(ctx, key.commit_index, &false);
            }
        }
    }

    fn has_expired_wait_keys(&self, now_millis: i64) -> bool {
        self.latches.values().any(|latch| latch.waiters.has_expired(now_millis))
    }

    fn cancel_all_wait_keys(&mut self, ctx: &mut ApplyContext) {
        for latch in self.latches.values_mut() {
            for key in latch.waiters.take_all() {
                service::cancel(ctx, key.commit_index, "Group is terminated");
            }
        }
    }
}
