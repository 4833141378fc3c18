//! Outbound connect retry with linear, monotonically non-decreasing
//! backoff capped at 10 seconds per step (spec §8: total elapsed wait
//! bounded by 1+2+...+10 per window). This is deliberately **not** the
//! exponential backoff the courier/relay loops use elsewhere in this
//! workspace — the bound here is on total wall-clock wait across a
//! bounded attempt count, not on unbounded reconnect pressure.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::BridgeError;

const MAX_BACKOFF_SECS: u64 = 10;

/// The backoff duration before the Nth retry (1-indexed): `min(n, 10)`
/// seconds.
pub fn backoff_seconds(attempt: u32) -> u64 {
    (attempt as u64).min(MAX_BACKOFF_SECS)
}

/// Retry `connect` up to `max_attempts` times, sleeping `backoff_seconds`
/// between tries. Returns the last error wrapped as
/// [`BridgeError::ConnectRetryExhausted`] once attempts are spent.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut connect: F) -> Result<T, BridgeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    if max_attempts == 0 {
        return Err(BridgeError::ConnectRetryExhausted { attempts: 0 });
    }

    for attempt in 1..=max_attempts {
        match connect(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt == max_attempts {
                    warn!(attempt, error = %e, "outbound connect retries exhausted");
                    return Err(BridgeError::ConnectRetryExhausted {
                        attempts: max_attempts,
                    });
                }
                let delay = backoff_seconds(attempt);
                warn!(attempt, delay_secs = delay, error = %e, "connect failed, backing off");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }

    unreachable!("loop either returns Ok or exhausts and returns Err")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(backoff_seconds(1), 1);
        assert_eq!(backoff_seconds(2), 2);
        assert_eq!(backoff_seconds(10), 10);
        assert_eq!(backoff_seconds(11), 10);
        assert_eq!(backoff_seconds(999), 10);
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing() {
        let mut prev = 0;
        for attempt in 1..20 {
            let cur = backoff_seconds(attempt);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_configured_attempts_with_expected_total_wait() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let start = tokio::time::Instant::now();
        let result: Result<(), BridgeError> = retry_with_backoff(2, move |_n| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "closed")) }
        })
        .await;

        assert!(matches!(
            result,
            Err(BridgeError::ConnectRetryExhausted { attempts: 2 })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // One backoff sleep of 1s between attempt 1 and 2; none after the
        // final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_sleeping_on_first_try() {
        let start = tokio::time::Instant::now();
        let result = retry_with_backoff(3, |_n| async { Ok::<_, io::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn three_attempts_wait_one_plus_two_seconds() {
        let start = tokio::time::Instant::now();
        let result: Result<(), BridgeError> = retry_with_backoff(3, |n| async move {
            if n == 3 {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "closed"))
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2));
    }
}
