use crate::api::RaftError;
use crate::commitlog::{Index, Log};
use crate::replica::election::{quorum_match_index, PeerStateUpdate};
use crate::replica::local_state::PersistentLocalState;
use crate::replica::log_entry::{LogEntry, RaftOp};
use crate::replica::raft_node::node::{internal_log_error, RaftNode};
use crate::replica::raft_state::RebuiltTail;
use crate::replica::replica_api::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor,
    InstallSnapshotInput, PeerReplyError, RaftNodeStatus,
};
use crate::replica::{RaftEndpoint, ReplicaId, Term};
use crate::transport::{RaftMessage, RaftRequest, RaftResponse, RaftTransport, TransportError};
use std::time::Duration;
use tokio::time::Instant;

impl<L, S> RaftNode<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    // ------- Leader side -------

    pub(super) fn broadcast_append_entries(&mut self) {
        let peer_ids = match self.state.election().leader_state() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.send_append_entries(&peer_id);
        }
    }

    pub(super) fn send_append_entries(&mut self, peer_id: &ReplicaId) {
        let (peer, next_index) = match self.state.election().leader_state().and_then(|ls| ls.peer_state(peer_id)) {
            Some(peer_state) => {
                // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding
                // request per peer; no pipelining. Entries are still batched.
                if peer_state.has_outstanding_request() {
                    slog::debug!(self.logger, "Request to {:?} still outstanding", peer_id);
                    return;
                }
                (peer_state.endpoint().clone(), peer_state.next())
            }
            None => {
                slog::debug!(self.logger, "No leader state for peer {:?}", peer_id);
                return;
            }
        };

        let (message, snapshot_index) = match self.new_replication_message(next_index) {
            Ok(v) => v,
            Err(e) => {
                slog::error!(
                    self.logger,
                    "Failed to build replication request for {:?} at {:?}: {:?}",
                    peer_id,
                    next_index,
                    e
                );
                return;
            }
        };

        let term = self.state.term();
        let seq_no = match self
            .state
            .election_mut()
            .leader_state_mut()
            .and_then(|ls| ls.peer_state_mut(peer_id))
        {
            Some(peer_state) => {
                peer_state.reset_heartbeat_timer();
                peer_state.next_seq_no()
            }
            None => return,
        };

        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term,
            seq_no,
            snapshot_index,
        };
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", peer_id), "SeqNo" => seq_no));
        let transport = self.transport.clone();
        let actor_client = self.actor_client.clone();
        let rpc_timeout = self.options.leader_append_entries_timeout;
        let request = RaftRequest {
            group_id: self.state.group_id().clone(),
            message,
        };

        tokio::task::spawn(async move {
            let result = call_peer(&logger, transport.as_ref(), &peer, request, rpc_timeout)
                .await
                .and_then(|response| match response {
                    RaftResponse::AppendEntries(output) => Ok(output),
                    _ => Err(PeerReplyError::Malformed),
                });
            let _ = actor_client
                .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
                .await;
        });
    }

    fn new_replication_message(&self, next_index: Index) -> Result<(RaftMessage, Option<Index>), RaftError> {
        let log = self.state.log();
        let term = self.state.term();
        let leader = self.state.local().clone();

        // The entries the follower needs are compacted away.
        if let Some(snapshot) = log.snapshot() {
            if next_index <= snapshot.index {
                let snapshot_index = snapshot.index;
                let message = RaftMessage::InstallSnapshot(InstallSnapshotInput {
                    leader,
                    term,
                    snapshot: snapshot.clone(),
                });
                return Ok((message, Some(snapshot_index)));
            }
        }

        let prev_log_index = next_index.minus(1);
        let prev_log_term = log
            .term_at(prev_log_index)
            .map_err(internal_log_error)?
            .ok_or_else(|| RaftError::Internal(format!("Missing log entry {:?}", prev_log_index)))?;

        let last_index = log.last_log_or_snapshot_index();
        let entries = if next_index <= last_index {
            let max_count = self.options.append_request_max_entry_count as u64;
            let to = last_index.min(next_index.plus(max_count - 1));
            log.entries_between(next_index, to).map_err(internal_log_error)?
        } else {
            Vec::new()
        };

        let message = RaftMessage::AppendEntries(AppendEntriesInput {
            leader,
            term,
            prev_log_index,
            prev_log_term,
            leader_commit_index: self.state.commit_index(),
            entries,
        });

        Ok((message, None))
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", reply.descriptor.peer_id),
            "SeqNo" => reply.descriptor.seq_no
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        if let Ok(output) = &reply.result {
            if self.step_down_if_term_increased(output.term(), None) {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                return;
            }
        }
        let current_term = self.state.term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        // 1. Translate reply into a peer log update
        let last_index = self.state.log().last_log_or_snapshot_index();
        let update = match reply.result {
            Ok(AppendEntriesOutput::Success { last_log_index, .. }) if last_log_index <= last_index => {
                if let Some(snapshot_index) = reply.descriptor.snapshot_index {
                    slog::info!(logger, "Peer installed snapshot {:?}", snapshot_index);
                }
                PeerStateUpdate::Success { last_log_index }
            }
            Ok(AppendEntriesOutput::Success { last_log_index, .. }) => {
                slog::warn!(
                    logger,
                    "Peer claims to have {:?}, past our last index {:?}",
                    last_log_index,
                    last_index
                );
                PeerStateUpdate::OtherError
            }
            Ok(AppendEntriesOutput::Failure {
                expected_next_index, ..
            }) => {
                slog::info!(logger, "Peer log diverges, retrying from {:?}", expected_next_index);
                PeerStateUpdate::Rewind { expected_next_index }
            }
            Err(PeerReplyError::Rejected(e)) => {
                slog::warn!(logger, "AE rejected: {:?}", e);
                PeerStateUpdate::OtherError
            }
            Err(e) => {
                slog::debug!(logger, "AE failure: {:?}", e);
                PeerStateUpdate::OtherError
            }
        };
        let made_progress = !matches!(update, PeerStateUpdate::OtherError);
        let is_success = matches!(update, PeerStateUpdate::Success { .. });

        // 2. Update peer log tracker
        let peer_state = match self
            .state
            .election_mut()
            .leader_state_mut()
            .and_then(|ls| ls.peer_state_mut(&reply.descriptor.peer_id))
        {
            Some(peer_state) => peer_state,
            None => {
                slog::info!(logger, "No longer leader, or peer was removed");
                return;
            }
        };
        if !peer_state.handle_append_entries_result(&logger, reply.descriptor.seq_no, update) {
            return;
        }
        let next_index = peer_state.next();

        // 3. Check for majority replication and apply new commits.
        if is_success {
            self.try_advance_commit_index();
        }

        // 4. > If last log index ≥ nextIndex for a follower: send
        //    > AppendEntries RPC with log entries starting at nextIndex
        if made_progress && self.state.log().last_log_or_snapshot_index() >= next_index {
            self.send_append_entries(&reply.descriptor.peer_id);
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    pub(super) fn try_advance_commit_index(&mut self) {
        let leader_state = match self.state.election().leader_state() {
            Some(leader_state) => leader_state,
            None => return,
        };

        // Only members of the latest membership count, which may exclude ourselves while a
        // removal of the leader is being committed.
        let members = self.state.last_members();
        let mut matches: Vec<Index> = leader_state
            .peers_iter()
            .filter(|p| members.contains(&p.endpoint().id))
            .map(|p| p.matched())
            .collect();
        if members.contains(&self.state.local().id) {
            matches.push(self.state.log().last_log_or_snapshot_index());
        }

        let quorum_index = quorum_match_index(matches, members.majority());
        if quorum_index <= self.state.commit_index() {
            return;
        }

        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        // Terms never decrease along the log, so no lower index can be of the current term either.
        match self.state.log().term_at(quorum_index) {
            Ok(Some(term)) if term == self.state.term() => {}
            Ok(_) => return,
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "IO failure while confirming new commit index {:?}: {:?}",
                    quorum_index,
                    e
                );
                return;
            }
        }

        if self.state.advance_commit_index(quorum_index) {
            slog::debug!(self.logger, "Commit index advanced to {:?}", quorum_index);
            self.apply_committed_entries();
        }
    }

    pub(super) fn run_housekeeping(&mut self) {
        // Check quorum. A leader cut off from the majority steps down instead of holding on to
        // clients that can't make progress.
        let now = Instant::now();
        let majority = self.state.majority();
        let quorum_timeout = self.options.leader_quorum_timeout;
        let has_quorum = match self.state.election().leader_state() {
            Some(leader_state) => leader_state.has_recent_quorum(now, quorum_timeout, majority),
            None => return,
        };
        if !has_quorum {
            slog::warn!(
                self.logger,
                "Haven't heard from a majority within {:?}. Stepping down.",
                quorum_timeout
            );
            let term = self.state.term();
            self.become_follower(term, None);
            return;
        }

        match self.status {
            RaftNodeStatus::Active | RaftNodeStatus::ChangingMembership => {}
            _ => return,
        }
        if let Some(index) = self.housekeeping_inflight {
            if index > self.state.last_applied() {
                return;
            }
        }

        let ops = self.state_machine.housekeeping_ops(chrono::Utc::now().timestamp_millis());
        for op in ops {
            if self.check_can_append().is_err() {
                break;
            }
            if let Some(index) = self.replicate_op(RaftOp::Service(op), None) {
                self.housekeeping_inflight.replace(index);
            }
        }
    }

    // ------- Follower side -------

    pub(crate) fn handle_append_entries(&mut self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RaftError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.state.term();
        if input.term < current_term {
            return Ok(AppendEntriesOutput::Failure {
                term: current_term,
                expected_next_index: self.state.log().last_log_or_snapshot_index().plus(1),
            });
        }
        self.accept_leader(input.term, &input.leader);
        let term = input.term;

        let snapshot_index = self.state.log().snapshot_index();
        let mut prev_log_index = input.prev_log_index;
        let mut prev_log_term = input.prev_log_term;
        let mut entries = input.entries;
        let last_sent_index = prev_log_index.plus(entries.len() as u64);

        // Everything up to our snapshot is committed, and therefore matches the leader.
        if prev_log_index < snapshot_index {
            let covered = entries.iter().take_while(|e| e.index <= snapshot_index).count();
            if covered == entries.len() {
                return Ok(AppendEntriesOutput::Success {
                    term,
                    last_log_index: last_sent_index,
                });
            }
            let boundary = &entries[covered - 1];
            prev_log_index = boundary.index;
            prev_log_term = boundary.term;
            entries.drain(..covered);
        }

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        let last_index = self.state.log().last_log_or_snapshot_index();
        if prev_log_index > last_index {
            return Ok(AppendEntriesOutput::Failure {
                term,
                expected_next_index: last_index.plus(1),
            });
        }
        let my_prev_term = self
            .state
            .log()
            .term_at(prev_log_index)
            .map_err(internal_log_error)?
            .ok_or_else(|| RaftError::Internal(format!("Missing log entry {:?}", prev_log_index)))?;
        if my_prev_term != prev_log_term {
            // Skip the whole conflicting term in one round trip. Committed entries always match.
            let first_of_term = self
                .state
                .log()
                .first_index_of_term(my_prev_term, prev_log_index)
                .map_err(internal_log_error)?;
            let expected_next_index = first_of_term.max(self.state.commit_index().plus(1));
            slog::info!(
                self.logger,
                "Log conflict at {:?}: mine {:?}, leader's {:?}. Expecting {:?} next.",
                prev_log_index,
                my_prev_term,
                prev_log_term,
                expected_next_index
            );
            return Ok(AppendEntriesOutput::Failure {
                term,
                expected_next_index,
            });
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut expected_index = prev_log_index.plus(1);
        let num_entries = entries.len() as u64;
        for new_entry in entries {
            if new_entry.index != expected_index {
                return Err(RaftError::Internal(format!(
                    "Leader sent entry {:?}, expected {:?}",
                    new_entry.index, expected_index
                )));
            }
            expected_index = expected_index.plus(1);

            if new_entry.index <= self.state.log().last_log_or_snapshot_index() {
                let existing_term = self.state.log().term_at(new_entry.index).map_err(internal_log_error)?;
                if existing_term == Some(new_entry.term) {
                    // 4. (no-op)
                    continue;
                }
                // 3. (delete)
                self.truncate_conflicting_entries(new_entry.index)?;
            }

            // 4. (append)
            self.state
                .log_mut()
                .append(new_entry.clone())
                .map_err(internal_log_error)?;
            self.on_entry_appended(&new_entry);
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let index_of_last_new_entry = prev_log_index.plus(num_entries);
        let new_commit_index = input.leader_commit_index.min(index_of_last_new_entry);
        if self.state.advance_commit_index(new_commit_index) {
            // > If commitIndex > lastApplied: increment lastApplied, apply
            // > log[lastApplied] to state machine (§5.3)
            self.apply_committed_entries();
        }

        Ok(AppendEntriesOutput::Success {
            term,
            last_log_index: index_of_last_new_entry,
        })
    }

    fn truncate_conflicting_entries(&mut self, from: Index) -> Result<(), RaftError> {
        if from <= self.state.commit_index() {
            return Err(RaftError::Internal(format!(
                "Leader conflicts with committed entry {:?}",
                from
            )));
        }

        let truncated = self.state.log_mut().truncate_from(from).map_err(internal_log_error)?;
        slog::info!(
            self.logger,
            "Truncated {} conflicting entries from {:?}",
            truncated.len(),
            from
        );

        let tail = self.state.rebuild_last_members().map_err(internal_log_error)?;
        self.apply_tail_status(tail);

        Ok(())
    }

    pub(crate) fn handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<AppendEntriesOutput, RaftError> {
        let current_term = self.state.term();
        if input.term < current_term {
            return Ok(AppendEntriesOutput::Failure {
                term: current_term,
                expected_next_index: self.state.log().last_log_or_snapshot_index().plus(1),
            });
        }
        self.accept_leader(input.term, &input.leader);
        let term = input.term;

        let snapshot = input.snapshot;
        let snapshot_index = snapshot.index;
        if snapshot_index <= self.state.commit_index() {
            slog::debug!(self.logger, "Already committed past snapshot {:?}", snapshot);
            return Ok(AppendEntriesOutput::Success {
                term,
                last_log_index: snapshot_index,
            });
        }

        let group_id = self.state.group_id().clone();
        self.state_machine
            .restore_snapshot(&group_id, snapshot_index, &snapshot.payload)?;
        let (dropped, tail) = self.state.install_snapshot(snapshot).map_err(internal_log_error)?;
        self.apply_tail_status(tail);
        slog::info!(
            self.logger,
            "Installed snapshot at {:?}, dropping {} log entries",
            snapshot_index,
            dropped
        );

        Ok(AppendEntriesOutput::Success {
            term,
            last_log_index: snapshot_index,
        })
    }

    /// AppendEntries or InstallSnapshot from a leader of at least our term.
    fn accept_leader(&mut self, term: Term, leader: &RaftEndpoint) {
        if !self.step_down_if_term_increased(term, Some(leader.clone())) {
            if self.state.election().is_follower() {
                self.state.election_mut().set_leader_if_unknown(leader);
            } else {
                // Candidate (or pre-candidate) of the same term: the election is already decided.
                self.become_follower(term, Some(leader.clone()));
            }
        }

        // Reset follower timeout.
        self.state.election().reset_timeout_if_follower();
        self.record_leader_contact();
    }

    fn apply_tail_status(&mut self, tail: RebuiltTail) {
        match self.status {
            RaftNodeStatus::Terminated | RaftNodeStatus::SteppedDown => {}
            _ => {
                self.status = if tail.terminating {
                    RaftNodeStatus::Terminating
                } else if tail.changing_membership {
                    RaftNodeStatus::ChangingMembership
                } else {
                    RaftNodeStatus::Active
                };
            }
        }
    }
}

/// Sends one request to a peer, bounded by `rpc_timeout`. A reply that carries an error is still
/// a reply: the peer is alive.
pub(super) async fn call_peer(
    logger: &slog::Logger,
    transport: &dyn RaftTransport,
    target: &RaftEndpoint,
    request: RaftRequest,
    rpc_timeout: Duration,
) -> Result<RaftResponse, PeerReplyError> {
    slog::debug!(logger, "ClientWire - {:?}", request.message);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.send_raft(target, request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    match rpc_reply {
        Ok(Ok(RaftResponse::Rejected(e))) => Err(PeerReplyError::Rejected(e)),
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(PeerReplyError::Transport(e)),
        Err(_elapsed) => Err(PeerReplyError::Transport(TransportError::Timeout(format!(
            "No reply from {:?} within {:?}",
            target.id, rpc_timeout
        )))),
    }
}
