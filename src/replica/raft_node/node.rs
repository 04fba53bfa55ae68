use crate::actor::{Callback, WeakActorClient};
use crate::api::{RaftError, RaftOptionsValidated};
use crate::commitlog::{Index, Log};
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_entry::{LogEntry, RaftOp};
use crate::replica::members::{RaftEndpoint, RaftGroupId, RaftGroupMembers};
use crate::replica::raft_log::{RaftLog, RaftLogError};
use crate::replica::raft_state::RaftState;
use crate::replica::replica_api::{
    ChangeMembershipOutput, GroupMembersView, LeaderTimerTick, RaftNodeReport, RaftNodeStatus, ReplicateInput,
};
use crate::replica::state_machine::StateMachine;
use crate::transport::RaftTransport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) struct RaftNodeConfig<L, S>
where
    L: Log<LogEntry>,
    S: PersistentLocalState,
{
    pub(crate) logger: slog::Logger,
    pub(crate) group_id: RaftGroupId,
    pub(crate) local: RaftEndpoint,
    pub(crate) initial_members: Vec<RaftEndpoint>,
    pub(crate) log: L,
    pub(crate) local_state: S,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) options: RaftOptionsValidated,
}

/// RaftNode drives one group's consensus on one member. Methods are called from the group's
/// event loop only; anything slow is spawned and comes back as an event.
pub(crate) struct RaftNode<L, S>
where
    L: Log<LogEntry>,
    S: PersistentLocalState,
{
    pub(super) logger: slog::Logger,
    pub(super) options: RaftOptionsValidated,
    pub(super) state: RaftState<L, S>,
    pub(super) status: RaftNodeStatus,
    pub(super) state_machine: Box<dyn StateMachine>,
    pub(super) transport: Arc<dyn RaftTransport>,
    pub(super) actor_client: WeakActorClient,

    // Appended by this node as leader, waiting for commit.
    pub(super) pending: BTreeMap<Index, PendingOp>,
    // Committed, but the state machine parked them until a later operation completes them.
    pub(super) postponed: HashMap<Index, Callback<Vec<u8>>>,
    // Last housekeeping proposal. New proposals wait until it's applied.
    pub(super) housekeeping_inflight: Option<Index>,
}

pub(super) struct PendingOp {
    pub(super) term: Term,
    pub(super) completion: Completion,
}

pub(super) enum Completion {
    Replicate(Callback<Vec<u8>>),
    ChangeMembership(Callback<ChangeMembershipOutput>),
    Terminate(Callback<()>),
}

impl Completion {
    pub(super) fn fail(self, error: RaftError) {
        match self {
            Completion::Replicate(cb) => cb.send(Err(error)),
            Completion::ChangeMembership(cb) => cb.send(Err(error)),
            Completion::Terminate(cb) => cb.send(Err(error)),
        }
    }
}

impl<L, S> RaftNode<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    pub(crate) fn new(config: RaftNodeConfig<L, S>) -> Result<(Self, ElectionStateChangeListener), RaftError> {
        let logger = config
            .logger
            .new(slog::o!("Group" => format!("{}/{}", config.group_id.name, config.group_id.seed)));
        let log = RaftLog::new(config.log).map_err(internal_log_error)?;
        let initial_term = config.local_state.current_term();
        let (election, listener) = ElectionState::new_follower(
            ElectionConfig {
                local: config.local.clone(),
                leader_heartbeat_duration: config.options.leader_heartbeat_duration,
                follower_min_timeout: config.options.follower_min_timeout,
                follower_max_timeout: config.options.follower_max_timeout,
                housekeeping_interval: config.options.housekeeping_interval,
            },
            config.actor_client.clone(),
            initial_term,
        );
        let state = RaftState::new(
            config.group_id,
            config.local,
            config.local_state,
            election,
            log,
            RaftGroupMembers::new(Index::ZERO, config.initial_members),
        );

        let node = RaftNode {
            logger,
            options: config.options,
            state,
            status: RaftNodeStatus::Active,
            state_machine: config.state_machine,
            transport: config.transport,
            actor_client: config.actor_client,
            pending: BTreeMap::new(),
            postponed: HashMap::new(),
            housekeeping_inflight: None,
        };

        Ok((node, listener))
    }

    // ------- Client operations -------

    pub(crate) fn handle_replicate(&mut self, input: ReplicateInput, callback: Callback<Vec<u8>>) {
        if let Err(e) = self.check_can_append() {
            callback.send(Err(e));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        self.replicate_op(RaftOp::Service(input.op), Some(Completion::Replicate(callback)));
    }

    pub(crate) fn handle_terminate_group(&mut self, callback: Callback<()>) {
        let result = self.check_can_append().and_then(|_| match self.status {
            RaftNodeStatus::Active => Ok(()),
            _ => Err(RaftError::CannotReplicate {
                group_id: self.state.group_id().clone(),
            }),
        });
        if let Err(e) = result {
            callback.send(Err(e));
            return;
        }

        slog::info!(self.logger, "Replicating group termination.");
        self.replicate_op(RaftOp::TerminateGroup, Some(Completion::Terminate(callback)));
    }

    pub(crate) fn handle_query_members(&self) -> Result<GroupMembersView, RaftError> {
        self.check_leader()?;

        Ok(GroupMembersView {
            term: self.state.term(),
            leader: self.state.local().clone(),
            members: self.state.committed_members().clone(),
        })
    }

    pub(crate) fn report(&self) -> RaftNodeReport {
        let log = self.state.log();
        RaftNodeReport {
            group_id: self.state.group_id().clone(),
            local: self.state.local().clone(),
            role: self.state.role(),
            status: self.status,
            term: self.state.term(),
            leader: self.state.leader().cloned(),
            commit_index: self.state.commit_index(),
            last_applied: self.state.last_applied(),
            last_log_index: log.last_log_or_snapshot_index(),
            last_log_term: log.last_log_or_snapshot_term(),
            snapshot_index: log.snapshot_index(),
            committed_members: self.state.committed_members().clone(),
            last_members: self.state.last_members().clone(),
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.state.term();
        if current_term != tick.term() {
            slog::debug!(
                self.logger,
                "Received leader timer for outdated term {:?}, current term: {:?}",
                tick.term(),
                current_term
            );
            return;
        }
        if !self.state.election().is_leader() {
            slog::info!(self.logger, "Received leader timer event but no longer leader.");
            return;
        }

        match tick {
            LeaderTimerTick::Heartbeat { peer_id, .. } => self.send_append_entries(&peer_id),
            LeaderTimerTick::Housekeeping { .. } => self.run_housekeeping(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        slog::info!(self.logger, "Shutting down with {} pending operations.", self.pending.len());
        self.fail_outstanding_operations(None);
    }

    // ------- Shared helpers -------

    pub(super) fn check_leader(&self) -> Result<(), RaftError> {
        match self.status {
            RaftNodeStatus::Terminated => {
                return Err(RaftError::RaftGroupTerminated {
                    group_id: self.state.group_id().clone(),
                })
            }
            RaftNodeStatus::SteppedDown => return Err(RaftError::not_leader(self.state.group_id(), None)),
            _ => {}
        }
        if !self.state.election().is_leader() {
            return Err(RaftError::not_leader(
                self.state.group_id(),
                self.state.leader().cloned(),
            ));
        }

        Ok(())
    }

    pub(super) fn check_can_append(&self) -> Result<(), RaftError> {
        self.check_leader()?;
        if self.status == RaftNodeStatus::Terminating {
            return Err(RaftError::CannotReplicate {
                group_id: self.state.group_id().clone(),
            });
        }

        let term_start_index = self
            .state
            .election()
            .leader_state()
            .map(|leader| leader.term_start_index())
            .unwrap_or_else(|| self.state.commit_index());
        let uncommitted = self.state.uncommitted_entry_count_after(term_start_index);
        if uncommitted >= self.options.uncommitted_entry_count_to_reject_new_appends {
            slog::warn!(
                self.logger,
                "Rejecting new append, {} entries are uncommitted.",
                uncommitted
            );
            return Err(RaftError::CannotReplicate {
                group_id: self.state.group_id().clone(),
            });
        }

        Ok(())
    }

    /// Appends `op` as leader, registers its completion, and kicks off replication.
    pub(super) fn replicate_op(&mut self, op: RaftOp, completion: Option<Completion>) -> Option<Index> {
        let term = self.state.term();
        let index = self.state.log().last_log_or_snapshot_index().plus(1);
        let entry = LogEntry {
            term,
            index,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            op,
        };

        slog::debug!(self.logger, "Appending {:?}", entry);
        if let Err(e) = self.state.log_mut().append(entry.clone()) {
            slog::error!(self.logger, "Failed to append {:?}: {:?}", entry, e);
            if let Some(c) = completion {
                c.fail(internal_log_error(e));
            }
            return None;
        }
        if let Some(completion) = completion {
            self.pending.insert(index, PendingOp { term, completion });
        }
        self.on_entry_appended(&entry);

        // Single member groups commit on append.
        self.try_advance_commit_index();
        self.broadcast_append_entries();

        Some(index)
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    pub(super) fn step_down_if_term_increased(&mut self, term: Term, leader: Option<RaftEndpoint>) -> bool {
        if !self.state.local_state_mut().store_term_if_increased(term) {
            return false;
        }

        self.become_follower(term, leader);
        true
    }

    pub(super) fn become_follower(&mut self, term: Term, leader: Option<RaftEndpoint>) {
        let was_leader = self.state.election().is_leader();
        self.state.election_mut().transition_to_follower(term, leader.clone());
        slog::info!(
            self.logger,
            "Transitioned to follower. Election state: {:?}",
            self.state.election()
        );

        if was_leader {
            self.fail_outstanding_operations(leader);
        }
    }

    /// Uncommitted operations may still commit under the next leader, so their outcome is
    /// unknown. Postponed ones are committed and safe to retry with the same invocation uid.
    pub(super) fn fail_outstanding_operations(&mut self, leader: Option<RaftEndpoint>) {
        for (index, pending) in std::mem::take(&mut self.pending) {
            pending.completion.fail(RaftError::IndeterminateOperationState(format!(
                "Leadership lost before entry {:?} of term {:?} committed",
                index, pending.term
            )));
        }
        for (_, callback) in std::mem::take(&mut self.postponed) {
            callback.send(Err(RaftError::not_leader(self.state.group_id(), leader.clone())));
        }
        self.housekeeping_inflight = None;
    }

    pub(super) fn take_pending(&mut self, index: Index, term: Term) -> Option<Completion> {
        let pending = self.pending.remove(&index)?;
        if pending.term == term {
            return Some(pending.completion);
        }

        // Our entry was replaced by another leader's.
        pending.completion.fail(RaftError::IndeterminateOperationState(format!(
            "Entry {:?} of term {:?} was overwritten",
            index, pending.term
        )));
        None
    }
}

pub(super) fn internal_log_error(e: RaftLogError) -> RaftError {
    RaftError::Internal(format!("Raft log failure: {}", e))
}
