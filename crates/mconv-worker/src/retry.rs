//! Exponential backoff for fallible async calls.
//!
//! Outcome delivery goes through here: the bot layer may be briefly
//! unreachable (network hiccups, platform rate limits).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry, doubled for each one after
    pub base_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Name used in log lines
    pub label: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            label: "call".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    /// Same as [`with_max_retries`](Self::with_max_retries), counting the first call.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.with_max_retries(max_attempts.saturating_sub(1))
    }

    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self { base_delay, ..self }
    }

    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `retry`, starting at 1.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// What [`retry_async`] ended with, and how many calls it took.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success { value: T, attempts: u32 },
    /// Last error once every attempt was used
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            Self::Success { attempts, .. } => attempts,
            Self::Failed { attempts, .. } => attempts,
        }
    }
}

/// Call `operation` until it succeeds or `config` runs out of attempts,
/// sleeping with exponential backoff in between.
///
/// ```ignore
/// let config = RetryConfig::new("deliver_outcome").with_max_attempts(3);
/// let result = retry_async(&config, || handler.handle(&outcome)).await;
/// ```
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, operation: F) -> RetryResult<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 1u32;
    loop {
        let error = match operation().await {
            Ok(value) => return RetryResult::Success { value, attempts },
            Err(error) => error,
        };

        if attempts > config.max_retries {
            warn!(
                label = %config.label,
                attempts,
                "giving up: {}", error
            );
            return RetryResult::Failed { error, attempts };
        }

        let wait = config.backoff(attempts);
        debug!(
            label = %config.label,
            attempts,
            wait_ms = wait.as_millis() as u64,
            "attempt failed, backing off: {}", error
        );
        tokio::time::sleep(wait).await;
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig::new("deliver")
            .with_base_delay(Duration::from_secs(4))
            .with_max_delay(Duration::from_secs(10));

        let waits = [1, 2, 3, 40].map(|n| config.backoff(n));
        assert_eq!(waits, [4, 8, 10, 10].map(Duration::from_secs));
    }

    #[test]
    fn test_attempts_include_first_call() {
        assert_eq!(RetryConfig::new("deliver").with_max_attempts(3).max_retries, 2);
        assert_eq!(RetryConfig::new("deliver").with_max_attempts(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_first_call_succeeds() {
        let calls = AtomicU32::new(0);

        let result = retry_async(&RetryConfig::new("deliver"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("sent") }
        })
        .await;

        assert!(matches!(result, RetryResult::Success { value: "sent", attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_call() {
        let config = RetryConfig::new("deliver").with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result = retry_async(&config, || {
            let seen = calls.fetch_add(1, Ordering::SeqCst);
            async move { if seen < 2 { Err("bot offline") } else { Ok(()) } }
        })
        .await;

        assert!(result.is_success());
        assert_eq!(result.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_last_attempt() {
        let config = RetryConfig::new("deliver").with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> = retry_async(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("bot offline") }
        })
        .await;

        assert!(matches!(result, RetryResult::Failed { error: "bot offline", attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
