use crate::commitlog::{Index, Log};
use crate::replica::election::ElectionState;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_entry::{LogEntry, RaftOp, SnapshotEntry};
use crate::replica::members::{RaftEndpoint, RaftGroupId, RaftGroupMembers, ReplicaId};
use crate::replica::raft_log::{RaftLog, RaftLogError};
use crate::replica::RaftRole;
use tokio::time::Instant;

/// RaftState is the mutable aggregate of one group on one member. It is owned by exactly one
/// `RaftNode` and only ever touched from that group's event loop.
pub(crate) struct RaftState<L, S>
where
    L: Log<LogEntry>,
    S: PersistentLocalState,
{
    group_id: RaftGroupId,
    local: RaftEndpoint,
    local_state: S,
    election: ElectionState,
    log: RaftLog<L>,

    // > index of highest log entry known to be committed
    // > (initialized to 0, increases monotonically)
    commit_index: Index,
    // > index of highest log entry applied to state machine
    // > (initialized to 0, increases monotonically)
    last_applied: Index,

    committed_members: RaftGroupMembers,
    // Possibly uncommitted. Used for elections and quorums as soon as it's appended.
    last_members: RaftGroupMembers,

    last_leader_contact: Option<Instant>,
}

impl<L, S> RaftState<L, S>
where
    L: Log<LogEntry>,
    S: PersistentLocalState,
{
    pub(crate) fn new(
        group_id: RaftGroupId,
        local: RaftEndpoint,
        local_state: S,
        election: ElectionState,
        log: RaftLog<L>,
        initial_members: RaftGroupMembers,
    ) -> Self {
        RaftState {
            group_id,
            local,
            local_state,
            election,
            log,
            commit_index: Index::ZERO,
            last_applied: Index::ZERO,
            committed_members: initial_members.clone(),
            last_members: initial_members,
            last_leader_contact: None,
        }
    }

    pub(crate) fn group_id(&self) -> &RaftGroupId {
        &self.group_id
    }

    pub(crate) fn local(&self) -> &RaftEndpoint {
        &self.local
    }

    pub(crate) fn term(&self) -> Term {
        self.local_state.current_term()
    }

    pub(crate) fn role(&self) -> RaftRole {
        self.election.role()
    }

    pub(crate) fn leader(&self) -> Option<&RaftEndpoint> {
        self.election.leader()
    }

    pub(crate) fn local_state(&self) -> &S {
        &self.local_state
    }

    pub(crate) fn local_state_mut(&mut self) -> &mut S {
        &mut self.local_state
    }

    pub(crate) fn election(&self) -> &ElectionState {
        &self.election
    }

    pub(crate) fn election_mut(&mut self) -> &mut ElectionState {
        &mut self.election
    }

    pub(crate) fn log(&self) -> &RaftLog<L> {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut RaftLog<L> {
        &mut self.log
    }

    pub(crate) fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Commit index only ratchets forward, and never past the end of the log. Returns true if it
    /// moved.
    pub(crate) fn advance_commit_index(&mut self, new_commit_index: Index) -> bool {
        let bounded = new_commit_index.min(self.log.last_log_or_snapshot_index());
        if bounded > self.commit_index {
            self.commit_index = bounded;
            true
        } else {
            false
        }
    }

    pub(crate) fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub(crate) fn set_last_applied(&mut self, index: Index) {
        debug_assert!(index <= self.commit_index);
        self.last_applied = index;
    }

    pub(crate) fn committed_members(&self) -> &RaftGroupMembers {
        &self.committed_members
    }

    pub(crate) fn last_members(&self) -> &RaftGroupMembers {
        &self.last_members
    }

    pub(crate) fn set_last_members(&mut self, members: RaftGroupMembers) {
        self.last_members = members;
    }

    pub(crate) fn commit_members(&mut self, members: RaftGroupMembers) {
        if self.last_members.index() <= members.index() {
            self.last_members = members.clone();
        }
        self.committed_members = members;
    }

    pub(crate) fn is_member(&self, id: &ReplicaId) -> bool {
        self.last_members.contains(id)
    }

    pub(crate) fn remote_members(&self) -> Vec<RaftEndpoint> {
        self.last_members.remote_members(&self.local.id).cloned().collect()
    }

    pub(crate) fn majority(&self) -> usize {
        self.last_members.majority()
    }

    /// Uncommitted entries after `from`. Entries a leader inherited from earlier terms only commit
    /// along with one of its own, so backpressure counts from the start of its term.
    pub(crate) fn uncommitted_entry_count_after(&self, from: Index) -> u64 {
        self.commit_index
            .max(from)
            .distance_to(self.log.last_log_or_snapshot_index())
    }

    pub(crate) fn last_leader_contact(&self) -> Option<Instant> {
        self.last_leader_contact
    }

    pub(crate) fn record_leader_contact(&mut self, at: Instant) {
        self.last_leader_contact.replace(at);
    }

    pub(crate) fn is_log_up_to_date(&self, candidate_last_term: Term, candidate_last_index: Index) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        let my_last_term = self.log.last_log_or_snapshot_term();
        if candidate_last_term != my_last_term {
            return candidate_last_term > my_last_term;
        }

        candidate_last_index >= self.log.last_log_or_snapshot_index()
    }

    /// Rebuilds `last_members` from the committed membership plus any membership entries still
    /// uncommitted in the log. Needed after a truncation or a snapshot install.
    pub(crate) fn rebuild_last_members(&mut self) -> Result<RebuiltTail, RaftLogError> {
        let mut members = self.committed_members.clone();
        let mut terminating = false;
        let from = self.commit_index.plus(1);
        let to = self.log.last_log_or_snapshot_index();
        for entry in self.log.entries_between(from, to)? {
            match entry.op {
                RaftOp::UpdateGroupMembers { members: list, .. } => {
                    members = RaftGroupMembers::new(entry.index, list);
                }
                RaftOp::TerminateGroup => terminating = true,
                RaftOp::Nop | RaftOp::Service(_) => {}
            }
        }

        let changing_membership = members.index() != self.committed_members.index();
        self.last_members = members;

        Ok(RebuiltTail {
            changing_membership,
            terminating,
        })
    }

    /// Installs a snapshot received from the leader. Log, commit index, and membership all jump
    /// to the snapshot's index.
    pub(crate) fn install_snapshot(
        &mut self,
        snapshot: SnapshotEntry,
    ) -> Result<(usize, RebuiltTail), RaftLogError> {
        let index = snapshot.index;
        let members = snapshot.group_members.clone();
        let dropped = self.log.set_snapshot(snapshot)?;

        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
        self.committed_members = members;
        let tail = self.rebuild_last_members()?;

        Ok((dropped, tail))
    }
}

/// What the uncommitted tail of the log implies about the node's status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RebuiltTail {
    pub(crate) changing_membership: bool,
    pub(crate) terminating: bool,
}
