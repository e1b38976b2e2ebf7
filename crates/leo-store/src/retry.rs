//! Single-retry policy for transient backend failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run an idempotent backend operation, retrying once on a transient error.
///
/// Anything other than [`Error::Transient`] surfaces immediately; a second
/// transient failure surfaces to the caller.
pub(crate) async fn with_transient_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Err(Error::Transient(message)) => {
            warn!("{operation} hit a transient backend error, retrying once: {message}");
            tokio::time::sleep(RETRY_DELAY).await;
            call().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_once_on_transient() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result = with_transient_retry("op", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Transient("flaky".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_surfaces() {
        let result: Result<()> = with_transient_retry("op", || async move {
            Err(Error::Transient("still flaky".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn non_transient_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<()> = with_transient_retry("op", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::storage("c/p", "broken"))
        })
        .await;
        assert!(matches!(result, Err(Error::Storage { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
