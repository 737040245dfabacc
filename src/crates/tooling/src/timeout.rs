//! Deadline wrappers for async operations
//!
//! Every external call in the control plane runs under an explicit deadline.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;

/// Error type for operations run under a deadline
#[derive(Debug)]
pub enum TimeoutError<E> {
    /// Operation completed but failed
    OperationFailed(E),
    /// Operation exceeded its deadline
    Timeout(Duration),
}

impl<E> TimeoutError<E> {
    /// Whether this was a deadline expiry rather than an inner failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout(_))
    }
}

impl<E: std::fmt::Display> std::fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
            TimeoutError::Timeout(d) => write!(f, "Operation timed out after {:?}", d),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TimeoutError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TimeoutError::OperationFailed(e) => Some(e),
            TimeoutError::Timeout(_) => None,
        }
    }
}

/// Execute a fallible async operation with a deadline.
pub async fn with_timeout<F, T, E>(duration: Duration, operation: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio_timeout(duration, operation).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(error)) => Err(TimeoutError::OperationFailed(error)),
        Err(_elapsed) => Err(TimeoutError::Timeout(duration)),
    }
}

/// Execute an infallible async operation with a deadline, returning `None`
/// when the deadline expires.
pub async fn with_deadline<F, T>(duration: Duration, operation: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio_timeout(duration, operation).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_inner_error_preserved() {
        let result: Result<(), _> =
            with_timeout(Duration::from_secs(1), async { Err("boom".to_string()) }).await;

        match result.unwrap_err() {
            TimeoutError::OperationFailed(e) => assert_eq!(e, "boom"),
            other => panic!("unexpected: {:?}", other.is_timeout()),
        }
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let result: Result<(), TimeoutError<String>> =
            with_timeout(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_with_deadline_none_on_expiry() {
        let result = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            7
        })
        .await;

        assert!(result.is_none());
    }
}
