use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryConfig {
    pub const fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Pause after the `attempt`-th failure: `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Backoff sleeps end early on cancellation.
pub async fn call_with_retry<F, Fut, T>(
    mut f: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!("[call_with_retry] attempt {attempt}/{attempts} failed: {err}");
                if attempt < attempts {
                    let delay = config.delay_for(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(attempts, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn unavailable() -> AdapterError {
        AdapterError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: "busy".into(),
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_backoffs() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let started = Instant::now();
        let result = call_with_retry(
            || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("done")
                }
            },
            &RetryConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), _> = call_with_retry(
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            },
            &RetryConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, AdapterError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), _> = call_with_retry(
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::HttpStatus {
                    status: StatusCode::UNAUTHORIZED,
                    body: String::new(),
                })
            },
            &RetryConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(AdapterError::HttpStatus { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = call_with_retry(
            || async { Err(unavailable()) },
            &RetryConfig::default(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(AdapterError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }
}
