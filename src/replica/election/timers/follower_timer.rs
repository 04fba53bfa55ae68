use crate::actor;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::signals::{self, SharedOption};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// FollowerTimerHandle keeps a follower (or candidate) timeout alive. Each reset pushes the
/// timeout out by a random duration in the configured range. Dropping the handle stops the task.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _to_drop: signals::Stopper,
}

struct FollowerTimerTask<C: Clock> {
    next_wake_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: signals::StopCheck,
    // Static wait between consecutive timeouts delivered to the actor, so an election that makes
    // no progress is retried at most once per minimum timeout.
    timeout_backoff: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = FollowerTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, FollowerTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let (stopper, stop_check) = signals::stop_signal();

        let task = FollowerTimerTask {
            next_wake_time: shared_opt.clone(),
            actor_client,
            clock: clock.clone(),
            stop_check,
            timeout_backoff: min_timeout,
        };
        let handle = FollowerTimerHandle {
            next_wake_time: shared_opt,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _to_drop: stopper,
        };

        // Task must start with a wake time present, otherwise it would time out immediately.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // Heard from the leader since the last wake up. Sleep until the new timeout.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Slept until `wake_time` without a reset. The actor decides whether this
                    // still matters (it may have concurrently received an AppendEntries).
                    if self.stop_check.should_stop() {
                        return;
                    }
                    if self.actor_client.follower_timeout().await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // Handle dropped: no longer in the same follower/candidate state.
            if self.stop_check.should_stop() {
                return;
            }
        }
    }
}
