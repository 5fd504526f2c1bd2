//! Minimum-interval request throttling.
//!
//! A [`RateLimiter`] enforces at least `1 / max_rate` seconds between the
//! moments successive `wait_if_needed` calls return. Clones share state, so
//! the same type serves both deployment shapes:
//!
//! - [`LimiterScope::PerWorker`]: every worker builds its own limiter and the
//!   aggregate rate is `max_rate × worker_count`.
//! - [`LimiterScope::Global`]: every worker holds a clone of one limiter,
//!   which caps the whole pool at `max_rate`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

/// Which workers a limiter instance is shared between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    #[default]
    PerWorker,
    Global,
}

/// Rate-limit parameters from the run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate")]
    pub max_requests_per_second: f64,
    #[serde(default)]
    pub scope: LimiterScope,
}

fn default_rate() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_rate(),
            scope: LimiterScope::PerWorker,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests_per_second: f64) -> Self {
        Self {
            max_requests_per_second,
            scope: LimiterScope::PerWorker,
        }
    }

    pub fn with_scope(mut self, scope: LimiterScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Longest interval a limiter will enforce between calls.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// Slowest rate a run configuration may ask for (one call per [`MAX_INTERVAL`]).
pub const MIN_RATE: f64 = 1.0 / 86_400.0;

/// Blocks callers until the configured minimum interval has passed.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    /// When the previous call returned.
    last_call: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// A rate that is not a positive finite number disables throttling.
    /// Intervals are capped at [`MAX_INTERVAL`].
    pub fn new(max_rate: f64) -> Self {
        let min_interval = if max_rate.is_finite() && max_rate > 0.0 {
            Duration::try_from_secs_f64(1.0 / max_rate)
                .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL))
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_call: Arc::new(Mutex::new(None)),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_if_needed(&self) {
        // Held across the sleep: concurrent callers queue up behind it.
        let mut last_call = self.last_call.lock().await;

        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let sleep_duration = self.min_interval - elapsed;
                tracing::debug!(sleep_ms = %sleep_duration.as_millis(), "Throttling request");
                tokio::time::sleep(sleep_duration).await;
            }
        }

        *last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_interval_is_inverse_of_rate() {
        assert_eq!(RateLimiter::new(4.0).min_interval(), Duration::from_millis(250));
        assert_eq!(RateLimiter::new(0.0).min_interval(), Duration::ZERO);
        assert_eq!(RateLimiter::new(f64::NAN).min_interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn first_call_does_not_wait() {
        let limiter = RateLimiter::new(1.0);
        let start = Instant::now();
        limiter.wait_if_needed().await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn consecutive_calls_span_at_least_n_minus_one_intervals() {
        let limiter = RateLimiter::new(20.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait_if_needed().await;
        }
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(200),
            "5 calls at 20/s should span at least 200ms, elapsed: {elapsed:?}"
        );
    }

    #[test]
    fn tiny_rates_are_capped_instead_of_overflowing() {
        assert_eq!(RateLimiter::new(1e-20).min_interval(), MAX_INTERVAL);
        assert_eq!(RateLimiter::new(f64::MIN_POSITIVE).min_interval(), MAX_INTERVAL);
        assert_eq!(RateLimiter::new(MIN_RATE / 2.0).min_interval(), MAX_INTERVAL);
        assert_eq!(RateLimiter::new(0.5).min_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn clones_share_the_throttle() {
        let limiter = RateLimiter::new(10.0);
        let other = limiter.clone();

        let start = Instant::now();
        limiter.wait_if_needed().await;
        other.wait_if_needed().await;

        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "Clones should be throttled against each other"
        );
    }

    #[tokio::test]
    async fn separate_instances_do_not_throttle_each_other() {
        let a = RateLimiter::new(2.0);
        let b = RateLimiter::new(2.0);

        let start = Instant::now();
        a.wait_if_needed().await;
        b.wait_if_needed().await;

        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn default_config_is_one_per_second_per_worker() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_requests_per_second, 1.0);
        assert_eq!(config.scope, LimiterScope::PerWorker);
    }
}
