use crate::api::RaftError;
use crate::commitlog::{Index, Log};
use crate::replica::local_state::PersistentLocalState;
use crate::replica::log_entry::{LogEntry, RaftOp, SnapshotEntry};
use crate::replica::raft_node::node::{Completion, RaftNode};
use crate::replica::replica_api::RaftNodeStatus;
use crate::replica::state_machine::{ApplyContext, OpOutcome};

impl<L, S> RaftNode<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    /// Applies every committed but unapplied entry, in order, exactly once.
    pub(super) fn apply_committed_entries(&mut self) {
        while self.state.last_applied() < self.state.commit_index() {
            let index = self.state.last_applied().plus(1);
            let entry = match self.state.log().entry(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    slog::error!(self.logger, "Committed entry {:?} is missing from the log", index);
                    return;
                }
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry {:?}: {:?}", index, e);
                    return;
                }
            };

            self.apply_entry(entry);
            self.state.set_last_applied(index);
        }

        self.take_snapshot_if_needed();
    }

    fn apply_entry(&mut self, entry: LogEntry) {
        let LogEntry {
            term,
            index,
            timestamp_millis,
            op,
        } = entry;

        match op {
            RaftOp::Nop => {}
            RaftOp::UpdateGroupMembers { members, .. } => self.apply_group_members(index, term, members),
            RaftOp::TerminateGroup => {
                self.status = RaftNodeStatus::Terminated;
                let mut ctx = ApplyContext::new(self.state.group_id().clone(), index, timestamp_millis);
                self.state_machine.on_group_terminated(&mut ctx);
                self.complete_postponed(ctx.take_completions());

                // Anything still parked can never complete now.
                let group_id = self.state.group_id().clone();
                for (_, callback) in std::mem::take(&mut self.postponed) {
                    callback.send(Err(RaftError::RaftGroupTerminated {
                        group_id: group_id.clone(),
                    }));
                }
                slog::info!(self.logger, "Group terminated at {:?}", index);

                if let Some(Completion::Terminate(callback)) = self.take_pending(index, term) {
                    callback.send(Ok(()));
                }
            }
            RaftOp::Service(op) => {
                let mut ctx = ApplyContext::new(self.state.group_id().clone(), index, timestamp_millis);
                let outcome = self.state_machine.apply(&mut ctx, &op);
                let completion = self.take_pending(index, term);

                match (outcome, completion) {
                    (OpOutcome::Applied(value), Some(Completion::Replicate(callback))) => callback.send(Ok(value)),
                    (OpOutcome::Failed(e), Some(Completion::Replicate(callback))) => callback.send(Err(e)),
                    (OpOutcome::Postponed, Some(Completion::Replicate(callback))) => {
                        self.postponed.insert(index, callback);
                    }
                    (OpOutcome::Failed(e), None) => {
                        slog::debug!(self.logger, "Entry {:?} failed: {:?}", index, e);
                    }
                    (_, Some(other)) => other.fail(RaftError::Internal(format!(
                        "Unexpected completion registered for service entry {:?}",
                        index
                    ))),
                    (OpOutcome::Applied(_), None) | (OpOutcome::Postponed, None) => {}
                }

                self.complete_postponed(ctx.take_completions());
            }
        }
    }

    fn complete_postponed(&mut self, completions: Vec<(Index, Result<Vec<u8>, RaftError>)>) {
        for (index, result) in completions {
            if let Some(callback) = self.postponed.remove(&index) {
                callback.send(result);
            }
        }
    }

    fn take_snapshot_if_needed(&mut self) {
        let last_applied = self.state.last_applied();
        let snapshot_index = self.state.log().snapshot_index();
        if snapshot_index.distance_to(last_applied) < self.options.commit_index_advance_count_to_snapshot {
            return;
        }

        let term = match self.state.log().term_at(last_applied) {
            Ok(Some(term)) => term,
            other => {
                slog::error!(
                    self.logger,
                    "Can't snapshot at {:?}, term lookup returned {:?}",
                    last_applied,
                    other
                );
                return;
            }
        };
        let group_id = self.state.group_id().clone();
        let payload = match self.state_machine.take_snapshot(&group_id, last_applied) {
            Ok(payload) => payload,
            Err(e) => {
                slog::error!(self.logger, "State machine failed to snapshot at {:?}: {:?}", last_applied, e);
                return;
            }
        };

        let snapshot = SnapshotEntry {
            term,
            index: last_applied,
            group_members: self.state.committed_members().clone(),
            payload,
        };
        match self.state.log_mut().set_snapshot(snapshot) {
            Ok(compacted) => slog::info!(
                self.logger,
                "Took snapshot at {:?}, compacting {} entries",
                last_applied,
                compacted
            ),
            Err(e) => slog::error!(self.logger, "Failed to install snapshot at {:?}: {:?}", last_applied, e),
        }
    }
}
