//! Deadlines and cancellation-independent execution for dependency calls.

use crate::error::{AuthError, Result};
use std::future::Future;
use std::time::Duration;

/// Run `call` with a deadline, mapping an elapsed deadline to `AuthError::Timeout`.
///
/// # Errors
///
/// Returns the call's own error, or `AuthError::Timeout` if `limit` elapses first.
pub async fn with_deadline<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if let Ok(result) = tokio::time::timeout(limit, call).await {
        result
    } else {
        tracing::warn!(
            operation,
            timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            "Dependency call timed out"
        );
        Err(AuthError::Timeout { operation })
    }
}

/// Run `work` on its own task and wait for it.
///
/// Dropping the returned future (caller cancellation) does not stop `work`.
///
/// # Errors
///
/// Returns the work's own error, or `AuthError::InternalError` if the task panicked.
pub async fn detached<T, F>(operation: &'static str, work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| {
        tracing::error!(operation, error = %e, "Detached store task failed");
        AuthError::InternalError(format!("{operation} task failed: {e}"))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let result: Result<()> = with_deadline("slow", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(AuthError::Timeout { operation: "slow" }));
    }

    #[tokio::test]
    async fn test_deadline_passes_through_errors() {
        let result: Result<()> = with_deadline("fast", Duration::from_secs(1), async {
            Err(AuthError::InvalidLinkToken)
        })
        .await;

        assert_eq!(result, Err(AuthError::InvalidLinkToken));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_work_survives_caller_cancellation() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let caller = detached("write", async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        // Caller gives up after one second.
        let abandoned = tokio::time::timeout(Duration::from_secs(1), caller).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
