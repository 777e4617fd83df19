use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::store::StoreError;

/// Base delay between conflicting attempts; doubles per attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(25);

/// Doubling stops here (25ms * 2^6 = 1.6s).
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF * 2u32.pow(attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS))
}

/// Run `attempt` until it succeeds, fails with anything other than a version
/// conflict, or `max_attempts` runs out. The closure receives the 1-based
/// attempt number and must re-read whatever it writes; a conflict means its
/// snapshot is stale.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n).await {
            Err(e) if e.is_conflict() && n < max_attempts => {
                debug!(attempt = n, max_attempts, error = %e, "Write conflict, retrying");
                tokio::time::sleep(backoff(n)).await;
                n += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use super::*;

    fn conflict() -> StoreError {
        StoreError::Conflict {
            id: Uuid::nil(),
            expected: 1,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_millis(25));
        assert_eq!(backoff(2), Duration::from_millis(50));
        assert_eq!(backoff(7), Duration::from_millis(1600));
        assert_eq!(backoff(40), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(3, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(conflict())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(2, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
