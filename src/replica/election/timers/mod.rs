mod clock;
mod follower_timer;
mod leader_timer;
mod signals;

#[cfg(test)]
mod test_utils;

pub(super) use follower_timer::FollowerTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;
