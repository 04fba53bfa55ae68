use crate::actor;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::signals::SharedOption;
use crate::replica::LeaderTimerTick;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// LeaderTimerHandle delivers `tick` to the actor once per period, unless the period is pushed
/// out by `reset_heartbeat_timer()`. Dropping the handle stops the task.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    period: Duration,
    next_tick_time: SharedOption<Instant>,
    clock: C,
}

struct LeaderTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_tick_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    tick: LeaderTimerTick,
    clock: C,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        period: Duration,
        actor_client: actor::WeakActorClient,
        tick: LeaderTimerTick,
    ) -> Self {
        // Add minimal logic in this constructor, as it is untested.
        let (task, handle) = LeaderTimerTask::new(period, actor_client, tick, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> LeaderTimerHandle<C> {
    /// Pushes the next tick one full period out from now.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset();
    }
}

impl<C: Clock> Shared<C> {
    fn reset(&self) {
        self.next_tick_time.replace(self.clock.now() + self.period);
    }
}

impl<C: Clock> LeaderTimerTask<C> {
    fn new(
        period: Duration,
        actor_client: actor::WeakActorClient,
        tick: LeaderTimerTick,
        clock: C,
    ) -> (Self, LeaderTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let shared = Arc::new(Shared {
            period,
            next_tick_time: shared_opt.clone(),
            clock: clock.clone(),
        });

        let task = LeaderTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_tick_time: shared_opt,
            actor_client,
            tick,
            clock,
        };
        let handle = LeaderTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The slot starts empty, so the first iteration ticks immediately. A new leader (or a
        // newly added follower) gets its first AppendEntries right away.
        loop {
            match self.next_tick_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => match self.weak_shared.upgrade() {
                    Some(shared) => {
                        if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                            return;
                        }
                        shared.reset();
                    }
                    // Handle dropped: no longer leader for this term.
                    None => return,
                },
            }
        }
    }
}
