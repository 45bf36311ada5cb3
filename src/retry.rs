//! Exponential backoff with jitter around a fallible async operation.
//!
//! The delay after the failed attempt `n` (zero-based) is
//! `min(max_delay, backoff_base^n * unit * jitter)` with `jitter` drawn
//! uniformly from `[0.8, 1.2)`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;

use crate::logging::{EventSink, IngestEvent};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
pub const MAX_DELAY: Duration = Duration::from_secs(60);

const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_base: f64,
    /// Scale of one backoff step; one second outside of tests.
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            unit: Duration::from_secs(1),
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_base.powi(exponent) * self.unit.as_secs_f64() * jitter;
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, events: Arc<dyn EventSink>) -> Self {
        Self { policy, events }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, is_retryable: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0_u32;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let next = attempt + 1;
            if !is_retryable(&err) || next >= self.policy.max_attempts {
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt);
            self.events.record(IngestEvent::Retrying {
                attempt: next,
                delay,
                error: err.to_string(),
            });
            tokio::time::sleep(delay).await;
            attempt = next;
        }
    }
}
