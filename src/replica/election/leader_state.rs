use crate::commitlog::Index;
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::{RaftEndpoint, ReplicaId};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// LeaderStateTracker holds what a leader knows about each follower's log, plus the leader-only
/// timers. It lives exactly as long as the term's leadership.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
    became_leader_at: Instant,
    // Last log index inherited from earlier terms.
    term_start_index: Index,
    _housekeeping_timer: LeaderTimerHandle,
}

impl LeaderStateTracker {
    pub(super) fn new(
        peer_state: HashMap<ReplicaId, PeerState>,
        term_start_index: Index,
        housekeeping_timer: LeaderTimerHandle,
    ) -> Self {
        LeaderStateTracker {
            peer_state,
            became_leader_at: Instant::now(),
            term_start_index,
            _housekeeping_timer: housekeeping_timer,
        }
    }

    pub(crate) fn term_start_index(&self) -> Index {
        self.term_start_index
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }

    pub(super) fn insert_peer(&mut self, peer_state: PeerState) {
        self.peer_state.insert(peer_state.endpoint.id.clone(), peer_state);
    }

    pub(super) fn remove_peer(&mut self, peer_id: &ReplicaId) -> bool {
        self.peer_state.remove(peer_id).is_some()
    }

    /// A leader that hasn't heard from a majority (itself included) within `quorum_timeout` can
    /// no longer be sure it is the only leader. Always true during the first `quorum_timeout` of
    /// the term, since followers haven't had a chance to respond yet.
    pub(crate) fn has_recent_quorum(&self, now: Instant, quorum_timeout: Duration, majority: usize) -> bool {
        if now.saturating_duration_since(self.became_leader_at) < quorum_timeout {
            return true;
        }

        let responsive_peers = self
            .peer_state
            .values()
            .filter(|p| match p.last_response_at {
                Some(at) => now.saturating_duration_since(at) < quorum_timeout,
                None => false,
            })
            .count();

        responsive_peers + 1 >= majority
    }
}

pub(crate) struct PeerState {
    endpoint: RaftEndpoint,

    // Held to send heartbeats for this peer
    leader_timer_handler: LeaderTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Index,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    last_response_at: Option<Instant>,
}

impl PeerState {
    pub(super) fn new(endpoint: RaftEndpoint, leader_timer_handler: LeaderTimerHandle, leader_last_index: Index) -> Self {
        PeerState {
            endpoint,
            leader_timer_handler,
            next: leader_last_index.plus(1),
            matched: Index::ZERO,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            last_response_at: None,
        }
    }

    pub(crate) fn endpoint(&self) -> &RaftEndpoint {
        &self.endpoint
    }

    pub(crate) fn next(&self) -> Index {
        self.next
    }

    pub(crate) fn matched(&self) -> Index {
        self.matched
    }

    /// Returns true if the update was accepted, i.e. it answers the latest outstanding request.
    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success { last_log_index } => {
                self.last_response_at.replace(Instant::now());
                self.update_log(logger, last_log_index);
            }
            PeerStateUpdate::Rewind { expected_next_index } => {
                self.last_response_at.replace(Instant::now());
                self.rewind_log(logger, expected_next_index);
            }
        }

        true
    }

    fn update_log(&mut self, logger: &slog::Logger, last_log_index: Index) {
        // Don't panic here, because peer could return garbage data.
        if last_log_index < self.matched {
            slog::warn!(
                logger,
                "Ignoring success that moves matched backwards. CurrentMatched={:?}, Reported={:?}",
                self.matched,
                last_log_index
            );
            return;
        }

        self.matched = last_log_index;
        self.next = last_log_index.plus(1);
    }

    fn rewind_log(&mut self, logger: &slog::Logger, expected_next_index: Index) {
        // Never below what the peer already confirmed, and always strictly backwards so
        // reconciliation terminates.
        let floor = self.matched.plus(1);
        let ceiling = match self.next.checked_minus(1) {
            Some(c) if c >= floor => c,
            _ => {
                slog::warn!(logger, "Can't rewind peer log below matched index {:?}.", self.matched);
                return;
            }
        };

        self.next = expected_next_index.max(floor).min(ceiling);
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.leader_timer_handler.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success { last_log_index: Index },
    Rewind { expected_next_index: Index },
    OtherError,
}

/// quorum_match_index returns the highest index that at least `majority` of the given match
/// indexes have reached.
pub(crate) fn quorum_match_index(mut match_indexes: Vec<Index>, majority: usize) -> Index {
    if majority == 0 || match_indexes.len() < majority {
        return Index::ZERO;
    }
    match_indexes.sort_unstable_by(|a, b| b.cmp(a));
    match_indexes[majority - 1]
}
