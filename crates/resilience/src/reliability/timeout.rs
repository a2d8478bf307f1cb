//! Timer race around a single operation
//!
//! The operation future is dropped when the timer wins. Work it already
//! handed off elsewhere is not cancelled; only its result is discarded.

use std::future::Future;
use std::time::Duration;

use crate::error::ResilienceError;

/// Error code for a retry attempt that ran out of time
pub const ATTEMPT_TIMEOUT: &str = "ATTEMPT_TIMEOUT";

/// Error code for a worker task that ran out of time
pub const TASK_TIMEOUT: &str = "TASK_TIMEOUT";

/// Await `fut`, failing with a `Timeout` error tagged `code` if `limit` elapses first
///
/// `None` waits without a limit.
pub async fn run_with_timeout<T, Fut>(
    fut: Fut,
    limit: Option<Duration>,
    code: &str,
) -> Result<T, ResilienceError>
where
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    let Some(limit) = limit else {
        return fut.await;
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(ResilienceError::timeout(format!(
            "operation exceeded its time limit of {}ms",
            limit.as_millis()
        ))
        .with_code(code)
        .with_details(serde_json::json!({ "limit_ms": limit.as_millis() as u64 }))
        .with_cause(elapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_limit() {
        let result = run_with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ResilienceError>(7)
            },
            Some(Duration::from_millis(100)),
            ATTEMPT_TIMEOUT,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = run_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ResilienceError>(())
            },
            Some(Duration::from_millis(100)),
            TASK_TIMEOUT,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.code, TASK_TIMEOUT);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_no_limit_passes_errors_through() {
        let err = run_with_timeout(
            async { Err::<(), _>(ResilienceError::server("boom")) },
            None,
            ATTEMPT_TIMEOUT,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Server);
    }
}
