//! Retry with exponential backoff and jitter.
//!
//! One policy object, used by the fetcher (honoring server-provided resume
//! delays) and by every summarization stage (pure exponential backoff).

use std::future::Future;
use std::time::Duration;

use mydigest_core::config::{RetryConfig, ScraperConfig};
use mydigest_core::{DigestError, Result};
use rand::Rng;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = fn(&DigestError) -> bool;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Cap on the exponential part; jitter is added on top.
    pub max_delay: Duration,
    pub max_jitter: Duration,
    /// Sleep exactly the upstream's resume delay when the error carries one.
    pub honor_retry_after: bool,
    pub retry_on: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Exponential backoff for the summarization endpoint.
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier.max(1.0),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_jitter: Duration::from_millis(cfg.max_jitter_ms),
            honor_retry_after: false,
            retry_on: DigestError::is_rate_limited,
        }
    }

    /// Flood-wait handling for the scraper: sleep what the server says.
    pub fn for_scraper(cfg: &ScraperConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_secs(cfg.default_flood_wait_secs),
            multiplier: 2.0,
            max_delay: Duration::from_secs(cfg.default_flood_wait_secs.saturating_mul(8)),
            max_jitter: Duration::ZERO,
            honor_retry_after: true,
            retry_on: DigestError::is_rate_limited,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Exponential part of the delay before retry `n` (1-based), capped.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// The delays this policy would sleep between attempts, jitter included.
    /// Always `max_attempts - 1` entries, non-decreasing.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut prev = Duration::ZERO;
        (1..self.max_attempts)
            .map(|retry| {
                let delay = (self.base_delay_for(retry) + self.jitter()).max(prev);
                prev = delay;
                delay
            })
            .collect()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut prev_delay = Duration::ZERO;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !(self.retry_on)(&err) {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!(label, attempts = attempt, "🛑 Retries exhausted: {err}");
                return Err(DigestError::RetriesExhausted {
                    label: label.to_string(),
                    attempts: attempt,
                });
            }

            let delay = match err.retry_after() {
                Some(server_delay) if self.honor_retry_after => server_delay,
                _ => {
                    let d = (self.base_delay_for(attempt) + self.jitter()).max(prev_delay);
                    prev_delay = d;
                    d
                }
            };
            tracing::info!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "⏳ Rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(Duration::from_millis(20))
    }

    #[test]
    fn test_backoff_schedule_monotonic_and_capped() {
        let p = policy().with_max_attempts(8);
        for _ in 0..50 {
            let schedule = p.backoff_schedule();
            assert_eq!(schedule.len(), 7);
            for pair in schedule.windows(2) {
                assert!(pair[1] >= pair[0], "backoff went down: {schedule:?}");
            }
            for d in &schedule {
                assert!(*d <= Duration::from_millis(520));
            }
        }
        assert_eq!(p.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(p.base_delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = policy()
            .run("always-throttled", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(DigestError::rate_limited(None))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            result,
            Err(DigestError::RetriesExhausted { attempts: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = policy()
            .run("broken", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(DigestError::Http("500".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(DigestError::Http(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_honors_server_retry_after() {
        let p = RetryPolicy::for_scraper(&ScraperConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = tokio::time::Instant::now();
        let value = p
            .run("flood", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(DigestError::rate_limited(Some(Duration::from_secs(7))))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(start.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow_between_attempts() {
        let p = policy().with_jitter(Duration::ZERO);
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = stamps.clone();
        let _: Result<()> = p
            .run("timing", || {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(tokio::time::Instant::now());
                    Err(DigestError::rate_limited(Some(Duration::from_secs(60))))
                }
            })
            .await;

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // server hint ignored: this policy does not honor retry_after
        assert_eq!(gaps, vec![100, 200, 400, 500]);
    }
}
