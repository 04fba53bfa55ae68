use crate::api::RaftError;
use crate::commitlog::Log;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_entry::{LogEntry, RaftOp};
use crate::replica::raft_node::node::RaftNode;
use crate::replica::raft_node::replication::call_peer;
use crate::replica::replica_api::{
    PeerReplyError, PreVoteInput, PreVoteOutput, PreVoteReplyFromPeer, RaftNodeStatus, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer,
};
use crate::replica::RaftEndpoint;
use crate::transport::{RaftMessage, RaftRequest, RaftResponse};
use tokio::time::Instant;

impl<L, S> RaftNode<L, S>
where
    L: Log<LogEntry> + Send + 'static,
    S: PersistentLocalState,
{
    pub(crate) fn handle_follower_timeout(&mut self) {
        match self.status {
            RaftNodeStatus::Terminated | RaftNodeStatus::SteppedDown => return,
            _ => {}
        }
        if self.state.election().is_leader() {
            return;
        }
        if !self.state.is_member(&self.state.local().id) {
            slog::debug!(self.logger, "Not a member of the latest group members. Not starting election.");
            return;
        }
        // The timer raced with an AppendEntries that is already processed.
        if self.heard_from_leader_recently() {
            return;
        }

        // Pre-vote first, so an isolated member doesn't disrupt the group by inflating its term.
        let next_term = self.state.term().next();
        self.state.election_mut().transition_to_pre_candidate(next_term);
        slog::info!(
            self.logger,
            "Timed out as follower. Starting pre-vote for term {:?}. Election state: {:?}",
            next_term,
            self.state.election()
        );

        if self.state.majority() <= 1 {
            self.start_election();
            return;
        }

        let log = self.state.log();
        let input = PreVoteInput {
            candidate: self.state.local().clone(),
            next_term,
            last_log_term: log.last_log_or_snapshot_term(),
            last_log_index: log.last_log_or_snapshot_index(),
        };
        for peer in self.state.remote_members() {
            self.call_peer_pre_vote(peer, input.clone());
        }
    }

    fn heard_from_leader_recently(&self) -> bool {
        match self.state.last_leader_contact() {
            Some(at) => at.elapsed() < self.options.follower_min_timeout,
            None => false,
        }
    }

    /// Answers whether we would vote for the candidate. Never mutates local state.
    pub(crate) fn handle_pre_vote(&mut self, input: PreVoteInput) -> Result<PreVoteOutput, RaftError> {
        let current_term = self.state.term();
        let deny = Ok(PreVoteOutput {
            term: current_term,
            vote_granted: false,
        });

        if !self.state.is_member(&input.candidate.id) {
            slog::info!(self.logger, "Not granting pre-vote. {:?} is not a member.", input.candidate.id);
            return deny;
        }
        if input.next_term <= current_term {
            slog::info!(
                self.logger,
                "Not granting pre-vote. Candidate's next term {:?} is not after ours {:?}.",
                input.next_term,
                current_term
            );
            return deny;
        }
        // Leader stickiness. A member that recently heard from a live leader doesn't help replace it.
        if self.state.election().is_leader() || self.heard_from_leader_recently() {
            slog::info!(
                self.logger,
                "Not granting pre-vote to {:?}. Leader is alive.",
                input.candidate.id
            );
            return deny;
        }
        if !self.state.is_log_up_to_date(input.last_log_term, input.last_log_index) {
            slog::info!(self.logger, "Not granting pre-vote. Candidate log is out of date.");
            return deny;
        }

        Ok(PreVoteOutput {
            term: current_term,
            vote_granted: true,
        })
    }

    pub(crate) fn handle_pre_vote_reply_from_peer(&mut self, reply: PreVoteReplyFromPeer) {
        let output = match reply.result {
            Ok(output) => output,
            Err(e) => {
                // The next follower timeout starts a new round.
                slog::debug!(self.logger, "PreVote to {:?} failed: {:?}", reply.peer_id, e);
                return;
            }
        };
        if self.step_down_if_term_increased(output.term, None) {
            return;
        }
        if !output.vote_granted {
            slog::info!(
                self.logger,
                "Pre-vote not granted from {:?} for term {:?}",
                reply.peer_id,
                reply.next_term
            );
            return;
        }

        let num_votes_received = match self
            .state
            .election_mut()
            .add_pre_vote_if_pre_candidate(reply.next_term, reply.peer_id)
        {
            Some(v) => v,
            None => return,
        };

        let majority = self.state.majority();
        slog::info!(
            self.logger,
            "Received {}/{} pre-votes for term {:?}",
            num_votes_received,
            self.state.last_members().size(),
            reply.next_term,
        );
        if num_votes_received >= majority {
            self.start_election();
        }
    }

    fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.state.local_state_mut().increment_term_and_vote_for_self();
        self.state.election_mut().transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Changed to candidate. Election state: {:?}",
            self.state.election(),
        );

        if self.state.majority() <= 1 {
            self.become_leader();
            return;
        }

        let log = self.state.log();
        let input = RequestVoteInput {
            candidate: self.state.local().clone(),
            term: new_term,
            last_log_term: log.last_log_or_snapshot_term(),
            last_log_index: log.last_log_or_snapshot_index(),
        };
        for peer in self.state.remote_members() {
            self.call_peer_request_vote(peer, input.clone());
        }
    }

    pub(crate) fn handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RaftError> {
        // Ensure candidate is known member.
        if !self.state.is_member(&input.candidate.id) {
            slog::info!(self.logger, "Not granting vote. {:?} is not a member.", input.candidate.id);
            return Ok(RequestVoteOutput {
                term: self.state.term(),
                vote_granted: false,
            });
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.state.local_state().voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return Ok(RequestVoteOutput {
                term: current_term,
                vote_granted: false,
            });
        }

        if self.step_down_if_term_increased(input.term, None) {
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let deny = Ok(RequestVoteOutput {
            term: input.term,
            vote_granted: false,
        });

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate.id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return deny;
            }
        }
        if !self.state.is_log_up_to_date(input.last_log_term, input.last_log_index) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return deny;
        }

        let cas_success = self
            .state
            .local_state_mut()
            .store_vote_for_term_if_unvoted(input.term, input.candidate.id.clone());
        if !cas_success {
            // Re-read state and grant if the earlier vote was for the same candidate, i.e. a retry.
            match self.state.local_state().voted_for_current_term() {
                (term, Some(voted_for)) if term == input.term && *voted_for == input.candidate.id => {}
                _ => return deny,
            }
        }

        slog::info!(self.logger, "Voting for {:?} in term {:?}.", input.candidate.id, input.term);
        self.state.election_mut().reset_timeout_if_follower();

        Ok(RequestVoteOutput {
            term: input.term,
            vote_granted: true,
        })
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let output = match reply.result {
            Ok(output) => output,
            Err(e) => {
                slog::debug!(self.logger, "RequestVote to {:?} failed: {:?}", reply.peer_id, e);
                return;
            }
        };
        if self.step_down_if_term_increased(output.term, None) {
            return;
        }

        let current_term = self.state.term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }
        if !output.vote_granted {
            slog::info!(
                self.logger,
                "Vote not granted from {:?} for term {:?}",
                reply.peer_id,
                reply.term,
            );
            return;
        }

        let num_votes_received = match self.state.election_mut().add_vote_if_candidate(reply.peer_id) {
            Some(v) => v,
            None => {
                slog::info!(
                    self.logger,
                    "Received vote for term {:?} after transitioning to election state: {:?}",
                    reply.term,
                    self.state.election(),
                );
                return;
            }
        };

        slog::info!(
            self.logger,
            "Received {}/{} votes for term {:?}",
            num_votes_received,
            self.state.last_members().size(),
            reply.term,
        );
        if num_votes_received >= self.state.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        let term = self.state.term();
        let followers = self.state.remote_members();
        let last_log_index = self.state.log().last_log_or_snapshot_index();

        // Heartbeat timers tick immediately, so every follower hears from us right away.
        self.state
            .election_mut()
            .transition_to_leader(term, followers, last_log_index);
        slog::info!(self.logger, "Became leader of term {:?}.", term);

        // A leader can only commit entries of its own term. The nop commits the entries of prior
        // terms along with it, so it skips backpressure.
        if self.options.append_nop_entry_on_leader_election {
            self.replicate_op(RaftOp::Nop, None);
        } else {
            self.try_advance_commit_index();
        }
    }

    fn call_peer_pre_vote(&self, peer: RaftEndpoint, input: PreVoteInput) {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer.id)));
        let transport = self.transport.clone();
        let actor_client = self.actor_client.clone();
        let rpc_timeout = self.options.leader_append_entries_timeout;
        let next_term = input.next_term;
        let request = RaftRequest {
            group_id: self.state.group_id().clone(),
            message: RaftMessage::PreVote(input),
        };

        tokio::task::spawn(async move {
            let result = call_peer(&logger, transport.as_ref(), &peer, request, rpc_timeout)
                .await
                .and_then(|response| match response {
                    RaftResponse::PreVote(output) => Ok(output),
                    _ => Err(PeerReplyError::Malformed),
                });
            let _ = actor_client
                .notify_pre_vote_reply_from_peer(PreVoteReplyFromPeer {
                    peer_id: peer.id,
                    next_term,
                    result,
                })
                .await;
        });
    }

    fn call_peer_request_vote(&self, peer: RaftEndpoint, input: RequestVoteInput) {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer.id)));
        let transport = self.transport.clone();
        let actor_client = self.actor_client.clone();
        let rpc_timeout = self.options.leader_append_entries_timeout;
        let term: Term = input.term;
        let request = RaftRequest {
            group_id: self.state.group_id().clone(),
            message: RaftMessage::RequestVote(input),
        };

        tokio::task::spawn(async move {
            let result = call_peer(&logger, transport.as_ref(), &peer, request, rpc_timeout)
                .await
                .and_then(|response| match response {
                    RaftResponse::RequestVote(output) => Ok(output),
                    _ => Err(PeerReplyError::Malformed),
                });
            let _ = actor_client
                .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                    peer_id: peer.id,
                    term,
                    result,
                })
                .await;
        });
    }

    pub(super) fn record_leader_contact(&mut self) {
        self.state.record_leader_contact(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{RaftError, RaftOptions};
    use crate::replica::raft_node::test_utils::TestNode;

    #[tokio::test]
    async fn new_leader_appends_nop_over_inherited_backlog() {
        // -- setup --
        let options = RaftOptions {
            uncommitted_entry_count_to_reject_new_appends: Some(1),
            ..RaftOptions::default()
        };
        let mut node = TestNode::new(3, &[1, 1], options);

        // -- execute --
        node.elect();

        // -- verify --
        assert_eq!(node.last_log_index(), 3);
        assert_eq!(node.term_at(3), Some(2));
        let mut rejected = node.replicate(vec![9]);
        assert!(matches!(rejected.try_recv(), Ok(Err(RaftError::CannotReplicate { .. }))));

        node.ack(2, 3).await;
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.applied(), vec![vec![1], vec![2]]);
        let mut accepted = node.replicate(vec![9]);
        assert!(accepted.try_recv().is_err());
        assert_eq!(node.last_log_index(), 4);
    }

    #[tokio::test]
    async fn backpressure_counts_only_entries_of_the_current_term() {
        // -- setup --
        let options = RaftOptions {
            uncommitted_entry_count_to_reject_new_appends: Some(1),
            append_nop_entry_on_leader_election: Some(false),
            ..RaftOptions::default()
        };
        let mut node = TestNode::new(3, &[1, 1], options);
        node.elect();

        // -- execute --
        let first = node.replicate(vec![7]);
        let mut second = node.replicate(vec![8]);

        // -- verify --
        assert!(matches!(second.try_recv(), Ok(Err(RaftError::CannotReplicate { .. }))));
        node.ack(2, 3).await;
        assert_eq!(node.commit_index(), 3);
        assert_eq!(first.await.unwrap(), Ok(vec![7]));
    }
}
