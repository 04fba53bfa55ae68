use crate::api::RaftError;
use crate::commitlog::Index;
use crate::replica::members::RaftGroupId;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
///
/// Every replica of a group applies the same committed operations in the same order, so an impl
/// must be deterministic: no wall clock reads, no randomness, no I/O. Time is available through
/// `ApplyContext::timestamp_millis`, which is stamped by the leader and replicated with the entry.
pub trait StateMachine: Send + 'static {
    /// apply is called exactly once per committed operation, only after it's been replicated to a
    /// majority. It never needs to be reversed.
    fn apply(&mut self, ctx: &mut ApplyContext, op: &[u8]) -> OpOutcome;

    fn take_snapshot(&self, group_id: &RaftGroupId, commit_index: Index) -> Result<Vec<u8>, RaftError>;

    /// Replaces the whole state with the snapshot. Equivalent to replaying every entry up to
    /// and including `commit_index`.
    fn restore_snapshot(&mut self, group_id: &RaftGroupId, commit_index: Index, snapshot: &[u8])
        -> Result<(), RaftError>;

    /// Operations the leader should propose on its housekeeping tick, e.g. expiring sessions.
    /// `now_millis` is the leader's wall clock; the proposed operations re-check against the
    /// committed entry timestamp when applied.
    fn housekeeping_ops(&self, _now_millis: i64) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// The group has committed its termination. Pending waiters should be completed through
    /// `ctx`.
    fn on_group_terminated(&mut self, _ctx: &mut ApplyContext) {}
}

/// OpOutcome is what applying a single operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Applied(Vec<u8>),
    /// The operation is parked until a later operation completes it through
    /// `ApplyContext::complete`, keyed by this operation's commit index.
    Postponed,
    Failed(RaftError),
}

pub struct ApplyContext {
    group_id: RaftGroupId,
    commit_index: Index,
    timestamp_millis: i64,
    completions: Vec<(Index, Result<Vec<u8>, RaftError>)>,
}

impl ApplyContext {
    pub fn new(group_id: RaftGroupId, commit_index: Index, timestamp_millis: i64) -> Self {
        ApplyContext {
            group_id,
            commit_index,
            timestamp_millis,
            completions: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &RaftGroupId {
        &self.group_id
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Completes the operation that was postponed at `postponed_index`.
    pub fn complete(&mut self, postponed_index: Index, result: Result<Vec<u8>, RaftError>) {
        self.completions.push((postponed_index, result));
    }

    pub fn take_completions(&mut self) -> Vec<(Index, Result<Vec<u8>, RaftError>)> {
        std::mem::take(&mut self.completions)
    }
}
