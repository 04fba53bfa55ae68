use crate::actor::Callback;
use crate::api::RaftError;
use crate::commitlog::{Index, Log};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_entry::{LogEntry, RaftOp};
use crate::replica::members::{MembershipChangeMode, RaftEndpoint, RaftGroupMembers};
use crate::replica::raft_node::node::{Completion, RaftNode};
use crate::replica::replica_api::{ChangeMembershipInput, ChangeMembershipOutput, RaftNodeStatus};

impl<L, S> RaftNode<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    pub(crate) fn handle_change_membership(
        &mut self,
        input: ChangeMembershipInput,
        callback: Callback<ChangeMembershipOutput>,
    ) {
        let new_members = match self.prepare_membership_change(&input) {
            Ok(members) => members,
            Err(e) => {
                slog::info!(self.logger, "Rejecting membership change {:?}: {:?}", input, e);
                callback.send(Err(e));
                return;
            }
        };

        slog::info!(
            self.logger,
            "Replicating membership change {:?} {:?}. New members: {:?}",
            input.mode,
            input.member.id,
            new_members.members()
        );
        let op = RaftOp::UpdateGroupMembers {
            members: new_members.members().to_vec(),
            member: input.member,
            mode: input.mode,
        };
        self.replicate_op(op, Some(Completion::ChangeMembership(callback)));
    }

    fn prepare_membership_change(&self, input: &ChangeMembershipInput) -> Result<RaftGroupMembers, RaftError> {
        self.check_can_append()?;

        let cannot_replicate = || RaftError::CannotReplicate {
            group_id: self.state.group_id().clone(),
        };
        // One membership change at a time.
        if self.status != RaftNodeStatus::Active {
            return Err(cannot_replicate());
        }
        let committed = self.state.committed_members();
        if self.state.last_members().index() != committed.index() {
            return Err(cannot_replicate());
        }
        // Until it commits an entry of its own term, the leader can't be sure its committed
        // membership is the group's latest.
        let commit_index = self.state.commit_index();
        match self.state.log().term_at(commit_index) {
            Ok(Some(term)) if term == self.state.term() => {}
            _ => return Err(cannot_replicate()),
        }

        if input.expected_members_commit_index != committed.index() {
            return Err(RaftError::MismatchingGroupMembersCommitIndex {
                expected: input.expected_members_commit_index,
                actual: committed.index(),
            });
        }
        match input.mode {
            MembershipChangeMode::Add if committed.contains(&input.member.id) => {
                return Err(RaftError::MemberAlreadyExists(input.member.clone()))
            }
            MembershipChangeMode::Remove if !committed.contains(&input.member.id) => {
                return Err(RaftError::MemberDoesNotExist(input.member.clone()))
            }
            _ => {}
        }

        let new_index = self.state.log().last_log_or_snapshot_index().plus(1);
        Ok(committed.apply_change(new_index, &input.member, input.mode))
    }

    /// Membership (and termination) entries take effect as soon as they are in the log, on leader
    /// and followers alike.
    pub(super) fn on_entry_appended(&mut self, entry: &LogEntry) {
        match &entry.op {
            RaftOp::UpdateGroupMembers { members, member, mode } => {
                self.state
                    .set_last_members(RaftGroupMembers::new(entry.index, members.clone()));
                if self.status == RaftNodeStatus::Active {
                    self.status = RaftNodeStatus::ChangingMembership;
                }
                self.update_leader_tracking(member, *mode, entry.index);
                slog::info!(
                    self.logger,
                    "Appended membership change at {:?}: {:?} {:?}",
                    entry.index,
                    mode,
                    member.id
                );
            }
            RaftOp::TerminateGroup => match self.status {
                RaftNodeStatus::Active | RaftNodeStatus::ChangingMembership => {
                    self.status = RaftNodeStatus::Terminating;
                }
                _ => {}
            },
            RaftOp::Nop | RaftOp::Service(_) => {}
        }
    }

    fn update_leader_tracking(&mut self, member: &RaftEndpoint, mode: MembershipChangeMode, index: Index) {
        if !self.state.election().is_leader() {
            return;
        }
        match mode {
            MembershipChangeMode::Add => {
                // The new member starts from an empty log. Its first rejection tells us where to
                // resume, which may be a snapshot.
                self.state
                    .election_mut()
                    .add_follower_if_leader(member.clone(), index);
            }
            MembershipChangeMode::Remove => {
                self.state.election_mut().remove_follower_if_leader(&member.id);
            }
        }
        // The majority changed with the membership. Re-evaluate right away.
        self.try_advance_commit_index();
    }

    pub(super) fn apply_group_members(&mut self, index: Index, term: Term, members: Vec<RaftEndpoint>) {
        let committed = RaftGroupMembers::new(index, members);
        self.state.commit_members(committed.clone());
        if self.status == RaftNodeStatus::ChangingMembership && self.state.last_members().index() == index {
            self.status = RaftNodeStatus::Active;
        }
        slog::info!(
            self.logger,
            "Committed group members at {:?}: {:?}",
            index,
            committed.members()
        );

        if let Some(Completion::ChangeMembership(callback)) = self.take_pending(index, term) {
            callback.send(Ok(ChangeMembershipOutput {
                members_commit_index: index,
                members: committed.members().to_vec(),
            }));
        }

        if !committed.contains(&self.state.local().id) {
            slog::info!(self.logger, "Removed from the group. Stepping down.");
            self.status = RaftNodeStatus::SteppedDown;
            if self.state.election().is_leader() {
                let term = self.state.term();
                self.become_follower(term, None);
            }
        }
    }
}
