//! Timeout enforcement.
//!
//! Every downstream call has a deadline. On expiry the call's future is
//! dropped, so a late completion can never report back.

use std::future::Future;
use std::time::Duration;

use crate::resilience::error_classifier::DownstreamError;

/// Run `fut` under `deadline`, mapping expiry to a timed-out transport error.
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T, DownstreamError>
where
    F: Future<Output = Result<T, DownstreamError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DownstreamError::timeout(deadline.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_passes_through_result() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok::<_, DownstreamError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = with_deadline(Duration::from_secs(1), async {
            Err::<(), _>(DownstreamError::status(500, "x"))
        })
        .await;
        assert_eq!(err.unwrap_err(), DownstreamError::status(500, "x"));
    }
}
