//! Exponential backoff with randomized jitter and a retry budget.
//!
//! A [`Backoff`] paces one logical retry session: the CAS retry loop of the
//! lease-aware client or the reconnect loop of a watch. Each call to
//! [`Backoff::next_delay`] draws a delay uniformly from the current window and
//! then doubles the window (capped at `max_delay`). [`Backoff::reset`] puts the
//! controller back to its first-call state once progress has been observed.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a backoff session stopped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// The cancellation token fired
    #[error("backoff cancelled")]
    Cancelled,

    /// The retry budget is spent
    #[error("terminated after {retries} retries")]
    RetriesExhausted { retries: u32 },
}

/// Configuration for a [`Backoff`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Lower bound of the first delay window
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,

    /// Upper bound the window grows towards
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Give up after this many retries; zero means retry forever
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

impl BackoffConfig {
    /// Create a config with an unlimited retry budget
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        BackoffConfig { min_delay, max_delay, max_retries: 0 }
    }

    /// Builder: set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay.is_zero() {
            return Err("min_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.min_delay {
            return Err(format!(
                "max_delay ({:?}) must not be smaller than min_delay ({:?})",
                self.max_delay, self.min_delay
            ));
        }
        Ok(())
    }
}

/// Stateful exponential backoff controller
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    cancel: CancellationToken,
    num_retries: u32,
    window_low: Duration,
    window_high: Duration,
}

impl Backoff {
    /// Create a controller bound to a cancellation token
    pub fn new(cancel: CancellationToken, config: BackoffConfig) -> Self {
        let window_low = config.min_delay;
        let window_high = double_capped(config.min_delay, config.max_delay);

        Backoff { config, cancel, num_retries: 0, window_low, window_high }
    }

    /// Restore the initial window and clear the retry count
    pub fn reset(&mut self) {
        self.num_retries = 0;
        self.window_low = self.config.min_delay;
        self.window_high = double_capped(self.config.min_delay, self.config.max_delay);
    }

    /// True while the caller should keep going
    pub fn ongoing(&self) -> bool {
        !self.cancel.is_cancelled()
            && (self.config.max_retries == 0 || self.num_retries < self.config.max_retries)
    }

    /// Reason the session stopped, if it did
    ///
    /// Cancellation takes precedence over an exhausted budget.
    pub fn err(&self) -> Option<BackoffError> {
        if self.cancel.is_cancelled() {
            return Some(BackoffError::Cancelled);
        }
        if self.config.max_retries != 0 && self.num_retries >= self.config.max_retries {
            return Some(BackoffError::RetriesExhausted { retries: self.num_retries });
        }
        None
    }

    /// Number of delays drawn since creation or the last reset
    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    /// Current `[low, high)` window the next delay is drawn from
    pub fn window(&self) -> (Duration, Duration) {
        (self.window_low, self.window_high)
    }

    /// Configuration this controller was built with
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Draw the next delay and grow the window
    pub fn next_delay(&mut self) -> Duration {
        self.num_retries = self.num_retries.saturating_add(1);

        // Collapsed window: min == max, or a misconfigured max < min.
        if self.window_low >= self.window_high {
            return self.window_low;
        }

        let span = self.window_high - self.window_low;
        let span_nanos = u64::try_from(span.as_nanos()).unwrap_or(u64::MAX);
        let jitter = Duration::from_nanos(rand::rng().random_range(0..span_nanos));
        let delay = self.window_low + jitter;

        if self.window_high < self.config.max_delay {
            self.window_low = double_capped(self.window_low, self.config.max_delay);
            self.window_high = double_capped(self.window_high, self.config.max_delay);
        }

        delay
    }

    /// Sleep for the next delay
    ///
    /// Returns without sleeping when the budget is spent by this retry, and
    /// returns early if the cancellation token fires first.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();

        if self.ongoing() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn double_capped(value: Duration, max: Duration) -> Duration {
    value.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Instant;

    fn backoff(min_ms: u64, max_ms: u64, max_retries: u32) -> Backoff {
        Backoff::new(
            CancellationToken::new(),
            BackoffConfig::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
                .with_max_retries(max_retries),
        )
    }

    #[test]
    fn test_initial_window() {
        let b = backoff(100, 10_000, 0);
        assert_eq!(b.window(), (Duration::from_millis(100), Duration::from_millis(200)));
        assert_eq!(b.num_retries(), 0);
    }

    #[test]
    fn test_window_doubles_and_caps() {
        let mut b = backoff(100, 500, 0);

        b.next_delay();
        assert_eq!(b.window(), (Duration::from_millis(200), Duration::from_millis(400)));

        b.next_delay();
        assert_eq!(b.window(), (Duration::from_millis(400), Duration::from_millis(500)));

        // High bound reached the cap, the window stops moving
        b.next_delay();
        assert_eq!(b.window(), (Duration::from_millis(400), Duration::from_millis(500)));
        assert_eq!(b.num_retries(), 3);
    }

    #[test]
    fn test_misconfigured_window_returns_min() {
        let mut b = backoff(500, 100, 0);
        for _ in 0..10 {
            assert_eq!(b.next_delay(), Duration::from_millis(500));
        }

        let mut b = backoff(250, 250, 0);
        for _ in 0..10 {
            assert_eq!(b.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_reset_restores_first_window() {
        let mut b = backoff(10, 1_000, 5);
        for _ in 0..4 {
            b.next_delay();
        }
        assert_eq!(b.num_retries(), 4);

        b.reset();
        assert_eq!(b.num_retries(), 0);
        assert_eq!(b.window(), (Duration::from_millis(10), Duration::from_millis(20)));

        let delay = b.next_delay();
        assert!(delay >= Duration::from_millis(10) && delay < Duration::from_millis(20));
    }

    #[test]
    fn test_ongoing_respects_budget() {
        let mut b = backoff(1, 2, 3);
        assert!(b.ongoing());
        assert!(b.err().is_none());

        b.next_delay();
        b.next_delay();
        assert!(b.ongoing());

        b.next_delay();
        assert!(!b.ongoing());
        assert_eq!(b.err(), Some(BackoffError::RetriesExhausted { retries: 3 }));
    }

    #[test]
    fn test_zero_budget_is_unlimited() {
        let mut b = backoff(1, 2, 0);
        for _ in 0..1_000 {
            b.next_delay();
        }
        assert!(b.ongoing());
        assert!(b.err().is_none());
    }

    #[test]
    fn test_cancellation_takes_precedence() {
        let token = CancellationToken::new();
        let mut b = Backoff::new(
            token.clone(),
            BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(2))
                .with_max_retries(1),
        );
        b.next_delay();
        token.cancel();

        assert!(!b.ongoing());
        assert_eq!(b.err(), Some(BackoffError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_within_window() {
        let mut b = backoff(100, 1_000, 0);
        let start = tokio::time::Instant::now();
        b.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let token = CancellationToken::new();
        let mut b = Backoff::new(
            token.clone(),
            BackoffConfig::new(Duration::from_secs(60), Duration::from_secs(120)),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let start = Instant::now();
        b.wait().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(b.err(), Some(BackoffError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_skips_sleep_when_budget_spent() {
        let mut b = Backoff::new(
            CancellationToken::new(),
            BackoffConfig::new(Duration::from_secs(60), Duration::from_secs(120))
                .with_max_retries(1),
        );

        let start = Instant::now();
        b.wait().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!b.ongoing());
    }

    #[test]
    fn test_config_validation() {
        assert!(BackoffConfig::default().validate().is_ok());
        assert!(BackoffConfig::new(Duration::ZERO, Duration::from_secs(1)).validate().is_err());
        assert!(BackoffConfig::new(Duration::from_secs(2), Duration::from_secs(1))
            .validate()
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_delays_stay_in_window(min_ms in 1u64..1_000, extra_ms in 0u64..10_000, calls in 1usize..40) {
            let max_ms = min_ms + extra_ms;
            let mut b = backoff(min_ms, max_ms, 0);
            let max = Duration::from_millis(max_ms);
            let mut last_high = b.window().1;

            for _ in 0..calls {
                let (low, high) = b.window();
                let delay = b.next_delay();
                if low < high {
                    prop_assert!(delay >= low && delay < high);
                } else {
                    prop_assert_eq!(delay, low);
                }

                let (_, next_high) = b.window();
                prop_assert!(next_high >= last_high);
                prop_assert!(next_high <= max);
                last_high = next_high;
            }
        }

        #[test]
        fn prop_collapsed_window_is_constant(min_ms in 1u64..1_000, less_ms in 0u64..1_000, calls in 1usize..20) {
            let max_ms = min_ms.saturating_sub(less_ms).max(1);
            prop_assume!(min_ms >= max_ms);
            let mut b = backoff(min_ms, max_ms, 0);

            for _ in 0..calls {
                prop_assert_eq!(b.next_delay(), Duration::from_millis(min_ms));
            }
        }
    }
}
