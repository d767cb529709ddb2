//! Bounded retry with exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, …
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Run `op` up to `attempts` times, retrying errors that are
/// [`is_retryable`](crate::error::BundlecastError::is_retryable).
pub async fn with_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    base_backoff_ms: u64,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff_delay(base_backoff_ms, attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BundlecastError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(0, 3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = with_retry("put", 3, 0, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BundlecastError::ObjectStore("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = with_retry("put", 5, 0, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BundlecastError::InvalidInput("bad key".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = with_retry("get", 3, 0, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BundlecastError::ObjectStore("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
