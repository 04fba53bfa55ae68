mod election_state;
mod leader_state;
mod state_change_listener;
mod timers;

pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionState;
pub(crate) use leader_state::quorum_match_index;
pub(crate) use leader_state::PeerStateUpdate;
pub use state_change_listener::ElectionStateChangeListener;
pub use state_change_listener::ElectionStateSnapshot;
