//! Bounded polling used while waiting for the server's reply.

use log::debug;
use mwplu_chat_config::ReconcileConfig;
use std::future::Future;
use std::time::Duration;

/// Fixed-interval retry policy over a bounded window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub window: Duration,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self { window, interval }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.poll_window(), config.poll_interval())
    }

    /// Total attempts: one immediate try plus one per elapsed interval.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let extra = self.window.as_millis() / self.interval.as_millis().max(1);
        1 + u32::try_from(extra).unwrap_or(u32::MAX - 1)
    }

    /// Run `attempt` until it yields a value or the attempts run out.
    ///
    /// The first attempt runs immediately and no sleep follows the last one.
    /// Errors from `attempt` stop polling and are returned as-is.
    pub async fn poll<T, E, F, Fut>(&self, mut attempt: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let max_attempts = self.max_attempts();
        for number in 1..=max_attempts {
            if let Some(value) = attempt(number).await? {
                debug!("poll succeeded (attempt={}, max_attempts={})", number, max_attempts);
                return Ok(Some(value));
            }
            if number < max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        debug!("poll exhausted (max_attempts={})", max_attempts);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;
    use std::time::Instant;

    #[test]
    fn default_policy_allows_nine_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.window, Duration::from_millis(3_000));
        assert_eq!(policy.interval, Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 9);
    }

    #[test]
    fn zero_interval_means_single_attempt() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test]
    async fn poll_stops_at_first_value() {
        let policy = RetryPolicy::new(Duration::from_millis(40), Duration::from_millis(10));
        let mut calls = 0;
        let found = policy
            .poll(|attempt| {
                calls += 1;
                async move { Ok::<_, Infallible>((attempt == 3).then_some(attempt)) }
            })
            .await
            .expect("poll");
        assert_eq!(found, Some(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn poll_exhausts_without_trailing_sleep() {
        let policy = RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(10));
        let mut calls = 0;
        let started = Instant::now();
        let found = policy
            .poll(|_| {
                calls += 1;
                async { Ok::<Option<()>, Infallible>(None) }
            })
            .await
            .expect("poll");
        assert_eq!(found, None);
        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn poll_propagates_errors() {
        let policy = RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(10));
        let result: Result<Option<()>, &str> = policy.poll(|_| async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));
    }
}
