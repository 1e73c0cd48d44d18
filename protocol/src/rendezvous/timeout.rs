//! # Interruptible Timeout
//!
//! The wait between two polls. Unlike a bare `sleep`, a pending wait can be
//! cut short from outside:
//!
//! - [`Timeout::resume`] releases the pending wait immediately and clears a
//!   previous suspension.
//! - [`Timeout::suspend`] stops the clock. The pending wait (and any wait
//!   started while suspended) only returns on resume or destroy.
//! - [`Timeout::trigger`] is `resume` that also covers the gap between two
//!   waits: with no wait pending, the next one returns at once.
//! - [`Timeout::destroy`] releases the pending wait, and every later wait
//!   returns at once.
//!
//! Only the most recent wait is pending: starting a new wait releases the
//! previous one.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct TimeoutState {
    destroyed: bool,
    suspended: bool,
    /// Incremented by every `wait`.
    generation: u64,
    /// Waits with a generation at or below this are released.
    released: u64,
    /// Highest generation whose wait has returned or been dropped.
    finished: u64,
    /// Release the next wait on arrival.
    armed: bool,
}

#[derive(Debug)]
pub struct Timeout {
    interval: Duration,
    state: Mutex<TimeoutState>,
    notify: Notify,
}

impl Timeout {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(TimeoutState::default()),
            notify: Notify::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Wait one interval, or until released.
    pub async fn wait(&self) {
        let generation = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.generation += 1;
            if std::mem::take(&mut state.armed) {
                state.finished = state.generation;
                return;
            }
            state.generation
        };
        let _finished = WaitGuard {
            timeout: self,
            generation,
        };
        // Supersede the previous waiter.
        self.notify.notify_waiters();

        let deadline = Instant::now() + self.interval;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let suspended = {
                let state = self.state.lock();
                if state.destroyed
                    || state.generation != generation
                    || state.released >= generation
                {
                    return;
                }
                state.suspended
            };

            if suspended {
                notified.await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return,
                    _ = &mut notified => {}
                }
            }
        }
    }

    pub fn suspend(&self) {
        self.state.lock().suspended = true;
        self.notify.notify_waiters();
    }

    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            state.suspended = false;
            state.released = state.generation;
        }
        self.notify.notify_waiters();
    }

    /// Release the pending wait, or the next one if none is pending.
    pub fn trigger(&self) {
        {
            let mut state = self.state.lock();
            state.suspended = false;
            if state.finished < state.generation {
                state.released = state.generation;
            } else {
                state.armed = true;
            }
        }
        self.notify.notify_waiters();
    }

    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.released = state.generation;
        }
        self.notify.notify_waiters();
    }
}

struct WaitGuard<'a> {
    timeout: &'a Timeout,
    generation: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.timeout.state.lock();
        state.finished = state.finished.max(self.generation);
    }
}

/// `base` jittered uniformly within +/-50%.
pub fn random_interval(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const INTERVAL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn wait_elapses_after_interval() {
        let timeout = Timeout::new(INTERVAL);
        let start = Instant::now();
        timeout.wait().await;
        assert!(start.elapsed() >= INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_pending_wait() {
        let timeout = Arc::new(Timeout::new(INTERVAL));
        let waiter = tokio::spawn({
            let timeout = timeout.clone();
            async move {
                let start = Instant::now();
                timeout.wait().await;
                start.elapsed()
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        timeout.resume();
        assert!(waiter.await.unwrap() < INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_wait_outlasts_interval_until_resume() {
        let timeout = Arc::new(Timeout::new(INTERVAL));
        timeout.suspend();
        let waiter = tokio::spawn({
            let timeout = timeout.clone();
            async move { timeout.wait().await }
        });

        tokio::time::sleep(INTERVAL * 3).await;
        assert!(!waiter.is_finished());

        timeout.resume();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("wait released by resume")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_releases_and_short_circuits() {
        let timeout = Arc::new(Timeout::new(INTERVAL));
        let waiter = tokio::spawn({
            let timeout = timeout.clone();
            async move { timeout.wait().await }
        });
        tokio::task::yield_now().await;
        timeout.destroy();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("wait released by destroy")
            .unwrap();

        let start = Instant::now();
        timeout.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(timeout.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_waiter_does_not_release_next_wait() {
        let timeout = Timeout::new(INTERVAL);
        timeout.resume();
        let start = Instant::now();
        timeout.wait().await;
        assert!(start.elapsed() >= INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_releases_pending_wait() {
        let timeout = Arc::new(Timeout::new(INTERVAL));
        timeout.suspend();
        let waiter = tokio::spawn({
            let timeout = timeout.clone();
            async move { timeout.wait().await }
        });
        tokio::task::yield_now().await;
        timeout.trigger();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("wait released by trigger")
            .unwrap();

        // Consumed by the released wait, so the next one runs its course.
        let start = Instant::now();
        timeout.wait().await;
        assert!(start.elapsed() >= INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_between_waits_releases_next_wait() {
        let timeout = Timeout::new(INTERVAL);
        timeout.wait().await;

        timeout.trigger();
        let start = Instant::now();
        timeout.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let start = Instant::now();
        timeout.wait().await;
        assert!(start.elapsed() >= INTERVAL);
    }

    #[test]
    fn jitter_stays_within_half() {
        let base = Duration::from_millis(1000);
        for _ in 0..1000 {
            let d = random_interval(base);
            assert!(d >= Duration::from_millis(500));
            assert!(d < Duration::from_millis(1500));
        }
        assert_eq!(random_interval(Duration::ZERO), Duration::ZERO);
    }
}
