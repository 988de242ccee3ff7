//! Bounded retry for collaborator calls.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trendradar_shared::{Result, RetryPolicy, TrendRadarError};

/// Call `attempt` until it succeeds, fails with a non-recoverable error,
/// or runs out of retries.
///
/// Every attempt runs under `policy.timeout`; an elapsed budget counts as a
/// recoverable timeout. The closure receives the 1-based attempt number.
/// Cancellation is honoured between attempts and while backing off.
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut number = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TrendRadarError::Cancelled(operation.to_string()));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TrendRadarError::Cancelled(operation.to_string()));
            }
            r = tokio::time::timeout(policy.timeout, attempt(number)) => r,
        };
        let err = match outcome {
            Ok(Ok(value)) => {
                if number > 1 {
                    debug!(operation, attempt = number, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => TrendRadarError::timeout(operation, policy.timeout),
        };

        if !err.is_recoverable() || number > policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for(number);
        warn!(
            operation,
            attempt = number,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TrendRadarError::Cancelled(operation.to_string()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = call_with_retry("op", &policy(2), &CancellationToken::new(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(TrendRadarError::Network("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry::<(), _, _>("op", &policy(1), &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TrendRadarError::Llm("500".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TrendRadarError::Llm(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry::<(), _, _>("op", &policy(5), &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TrendRadarError::validation("nope")) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TrendRadarError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let err = call_with_retry::<(), _, _>("slow call", &policy(0), &CancellationToken::new(), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TrendRadarError::Timeout { .. }));
        assert!(err.to_string().starts_with("slow call timed out"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = call_with_retry::<(), _, _>("op", &policy(3), &cancel, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TrendRadarError::Cancelled(_)));
    }
}
