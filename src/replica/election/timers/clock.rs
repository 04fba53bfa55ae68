#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock lets timer tasks run against tokio time in production and a hand-driven clock in tests.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let start = Instant::now();
    let (tx, rx) = watch::channel(start);

    (MockClock { current_time: rx }, MockClockController { current_time: tx, start })
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    current_time: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current_time.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.current_time.borrow() < deadline {
            if self.current_time.changed().await.is_err() {
                // Controller is gone, time will never move again.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    current_time: watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn current_time(&self) -> Instant {
        *self.current_time.borrow()
    }

    pub(crate) fn elapsed_time(&self) -> Duration {
        self.current_time() - self.start
    }

    /// `sleep_until()` only promises to return once `now` is at or past its deadline. Advancing
    /// in one big leap wakes every sleeper once, possibly well past its deadline, so advance in
    /// steps smaller than the granularity you want to observe.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let new_now = self.current_time() + duration;
        let _ = self.current_time.send(new_now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_wakes_sleepers_on_advance() {
        let tick = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut mock_clock, mut controller) = mocked_clock();
        let start = controller.current_time();

        tokio::spawn(async move {
            let mut next_wake = start;
            loop {
                next_wake += tick;
                mock_clock.sleep_until(next_wake).await;
                if tx.send(()).is_err() {
                    return;
                }
            }
        });

        // Half-tick offset to avoid off-by-1.
        controller.advance(tick / 2);
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        controller.advance(tick);
        rx.recv().await.unwrap();
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        // Multiple ticks at once still wake the sleeper once per tick.
        controller.advance(tick * 3);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        assert_eq!(controller.elapsed_time(), tick * 9 / 2);
    }
}
