use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::leader_state::{LeaderStateTracker, PeerState};
use crate::replica::election::state_change_listener::{
    self, ElectionStateChangeListener, ElectionStateChangeNotifier, ElectionStateSnapshot,
};
use crate::replica::election::timers::{FollowerTimerHandle, LeaderTimerHandle};
use crate::replica::{LeaderTimerTick, RaftEndpoint, RaftRole, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub(crate) local: RaftEndpoint,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) housekeeping_interval: Duration,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    term: Term,
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(term, &initial_state));

        let election_state = Self {
            term,
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn term(&self) -> Term {
        self.term
    }

    pub(crate) fn role(&self) -> RaftRole {
        match &self.state {
            State::Leader(_) => RaftRole::Leader,
            State::Candidate(_) => RaftRole::Candidate,
            State::PreCandidate(_) | State::Follower(_) => RaftRole::Follower,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    /// True only while following (or waiting for) a leader, i.e. not in any election round.
    pub(crate) fn is_follower(&self) -> bool {
        matches!(self.state, State::Follower(_))
    }

    /// The leader as known locally: ourselves if leader, the followed leader otherwise.
    pub(crate) fn leader(&self) -> Option<&RaftEndpoint> {
        match &self.state {
            State::Leader(_) => Some(&self.config.local),
            State::Follower(fs) => fs.leader.as_ref(),
            State::Candidate(_) | State::PreCandidate(_) => None,
        }
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<RaftEndpoint>) {
        self.term = term;
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    /// Pre-voting happens within the current term. Only the round's target term is recorded.
    pub(crate) fn transition_to_pre_candidate(&mut self, next_term: Term) {
        let mut pcs = VoteCollector::new(next_term, &self.config, self.actor_client.clone());
        pcs.add_received_vote(self.config.local.id.clone());

        self.state = State::PreCandidate(pcs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = VoteCollector::new(term, &self.config, self.actor_client.clone());

        // Vote for self
        cs.add_received_vote(self.config.local.id.clone());

        self.term = term;
        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, followers: Vec<RaftEndpoint>, last_log_index: Index) {
        let mut peer_state = HashMap::with_capacity(followers.len());
        for endpoint in followers {
            let ps = self.new_peer_state(term, endpoint, last_log_index);
            peer_state.insert(ps.endpoint().id.clone(), ps);
        }
        let housekeeping_timer = LeaderTimerHandle::spawn_timer_task(
            self.config.housekeeping_interval,
            self.actor_client.clone(),
            LeaderTimerTick::Housekeeping { term },
        );

        self.term = term;
        self.state = State::Leader(LeaderStateTracker::new(peer_state, last_log_index, housekeeping_timer));
        self.notify_new_state();
    }

    fn new_peer_state(&self, term: Term, endpoint: RaftEndpoint, last_log_index: Index) -> PeerState {
        let timer = LeaderTimerHandle::spawn_timer_task(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            LeaderTimerTick::Heartbeat {
                peer_id: endpoint.id.clone(),
                term,
            },
        );
        PeerState::new(endpoint, timer, last_log_index)
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(self.term, &self.state)
    }

    fn current_state_impl(term: Term, state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader { term },
            State::Candidate(_) => ElectionStateSnapshot::Candidate { term },
            State::PreCandidate(_) | State::Follower(FollowerState { leader: None, .. }) => {
                ElectionStateSnapshot::FollowerNoLeader { term }
            }
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => ElectionStateSnapshot::Follower {
                term,
                leader: leader.clone(),
            },
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &RaftEndpoint) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of pre-votes received for `next_term`, or None if no longer pre-voting for it.
    pub(crate) fn add_pre_vote_if_pre_candidate(&mut self, next_term: Term, vote_from: ReplicaId) -> Option<usize> {
        match &mut self.state {
            State::PreCandidate(pcs) if pcs.term == next_term => Some(pcs.add_received_vote(vote_from)),
            _ => None,
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(ls)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(ls)
        } else {
            None
        }
    }

    /// Starts tracking (and heartbeating) a member that joined while we're leader.
    pub(crate) fn add_follower_if_leader(&mut self, endpoint: RaftEndpoint, last_log_index: Index) {
        if !self.is_leader() || endpoint.id == self.config.local.id {
            return;
        }
        let ps = self.new_peer_state(self.term, endpoint, last_log_index);
        if let State::Leader(ls) = &mut self.state {
            ls.insert_peer(ps);
        }
    }

    pub(crate) fn remove_follower_if_leader(&mut self, peer_id: &ReplicaId) {
        if let State::Leader(ls) = &mut self.state {
            ls.remove_peer(peer_id);
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader({:?})", self.term),
            State::Candidate(_) => write!(f, "Candidate({:?})", self.term),
            State::PreCandidate(pcs) => write!(f, "PreCandidate({:?}, next={:?})", self.term, pcs.term),
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => write!(f, "Follower({:?}, Leader={:?})", self.term, leader.id),
            State::Follower(FollowerState { leader: None, .. }) => {
                write!(f, "Follower({:?}, Leader=None)", self.term)
            }
        }
    }
}

enum State {
    Leader(LeaderStateTracker),
    Candidate(VoteCollector),
    PreCandidate(VoteCollector),
    Follower(FollowerState),
}

/// VoteCollector counts votes for one round, either a pre-vote or a real election.
struct VoteCollector {
    term: Term,
    received_votes_from: HashSet<ReplicaId>,
    _follower_timeout_tracker: FollowerTimerHandle,
}

struct FollowerState {
    leader: Option<RaftEndpoint>,
    follower_timeout_tracker: FollowerTimerHandle,
}

impl VoteCollector {
    fn new(term: Term, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            term,
            received_votes_from: HashSet::with_capacity(3),
            _follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<RaftEndpoint>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    fn reset_timeout(&self) {
        self.follower_timeout_tracker.reset_timeout();
    }
}
