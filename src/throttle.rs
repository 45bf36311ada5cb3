use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces out requests against the single source session.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn from_rate(calls_per_second: f64) -> Self {
        if !calls_per_second.is_finite() || calls_per_second <= 0.0 {
            return Self::new(Duration::ZERO);
        }
        Self::new(Duration::from_secs_f64(1.0 / calls_per_second))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until at least `interval` has passed since the previous request,
    /// then stamps this one.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        self.sleep_out(*last).await;
        *last = Some(Instant::now());
    }

    /// Inter-request delay after a chapter attempt. Sleeps out the rest of the
    /// interval without stamping, so the following `wait` returns at once.
    pub async fn cooldown(&self) {
        let last = self.last.lock().await;
        self.sleep_out(*last).await;
    }

    async fn sleep_out(&self, previous: Option<Instant>) {
        let Some(previous) = previous else {
            return;
        };
        let elapsed = previous.elapsed();
        if elapsed < self.interval {
            let remaining = self.interval - elapsed;
            tracing::debug!(wait_ms = remaining.as_millis() as u64, "pacing request");
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_wait_is_spaced_by_interval() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn cooldown_waits_out_interval_after_request() {
        let pacer = RequestPacer::new(Duration::from_millis(30));
        let start = Instant::now();
        pacer.wait().await;
        pacer.cooldown().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cooldown_and_next_wait_share_one_interval() {
        let interval = Duration::from_millis(120);
        let pacer = RequestPacer::new(interval);
        pacer.wait().await;
        let start = Instant::now();
        pacer.cooldown().await;
        pacer.wait().await;
        let gap = start.elapsed();
        assert!(gap >= interval - Duration::from_millis(5), "{gap:?}");
        assert!(gap < interval * 2 - Duration::from_millis(20), "{gap:?}");
    }

    #[tokio::test]
    async fn cooldown_before_any_request_returns_immediately() {
        let pacer = RequestPacer::new(Duration::from_secs(5));
        let start = Instant::now();
        pacer.cooldown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn rate_converts_to_interval() {
        assert_eq!(RequestPacer::from_rate(2.0).interval(), Duration::from_millis(500));
        assert_eq!(RequestPacer::from_rate(0.0).interval(), Duration::ZERO);
    }
}
