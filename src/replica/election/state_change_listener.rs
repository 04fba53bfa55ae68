use crate::replica::{RaftEndpoint, Term};
use tokio::sync::watch;

/// ElectionStateSnapshot is the externally observable election state of one node in one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionStateSnapshot {
    Leader { term: Term },
    Candidate { term: Term },
    Follower { term: Term, leader: RaftEndpoint },
    FollowerNoLeader { term: Term },
}

impl ElectionStateSnapshot {
    pub fn term(&self) -> Term {
        match self {
            ElectionStateSnapshot::Leader { term }
            | ElectionStateSnapshot::Candidate { term }
            | ElectionStateSnapshot::Follower { term, .. }
            | ElectionStateSnapshot::FollowerNoLeader { term } => *term,
        }
    }
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

/// ElectionStateChangeListener observes a group's election state. Intermediate states may be
/// skipped if the listener falls behind; `next()` always yields the latest.
#[derive(Clone)]
pub struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }

    /// Returns None once the group's node has shut down.
    pub async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
