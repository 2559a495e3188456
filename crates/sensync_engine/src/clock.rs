//! Time source for deadlines, backoff and timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Wall clock plus an async sleep.
///
/// Every wait the engine performs (ack deadlines, retry backoff,
/// reconnect delays) goes through this trait.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock with its own wall time that records every sleep.
///
/// `now()` starts at a fixed instant and moves only by the amounts slept or
/// [`advance`](Self::advance)d. The wait itself runs on the tokio timer, so
/// under a paused runtime a sleep completes as soon as every other task is
/// idle. Useful for asserting a backoff schedule.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Creates a manual clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Moves the clock forward without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::default())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::time::sleep(duration).await;
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn manual_clock_records_sleeps() {
        let clock = ManualClock::default();
        clock.sleep(Duration::from_millis(100)).await;
        clock.sleep(Duration::from_secs(2)).await;

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_secs(2)]
        );
        assert_eq!(clock.now().timestamp_millis(), 2_100);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_sleeps_on_the_timer() {
        let before = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(5)).await;
        assert!(before.elapsed() >= Duration::from_secs(5));
    }
}
