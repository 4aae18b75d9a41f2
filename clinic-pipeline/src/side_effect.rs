//! Best-effort side effects.
//!
//! Work that accompanies a primary operation (cache write-back, tag
//! invalidation, audit records) goes through [`best_effort`]: it is raced
//! against a timeout, any failure is logged at `warn`, and the caller only
//! learns whether a value came back.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use clinic_core::ClinicError;
use tracing::warn;

/// Run `fut` for at most `timeout`.
///
/// Returns `Some` on success and `None` on error or timeout. Never fails.
pub async fn best_effort<T, E, F>(label: &str, timeout: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(label, error = %e, "Best-effort operation failed");
            None
        }
        Err(_) => {
            let err = ClinicError::Timeout {
                label: label.to_string(),
                after: timeout,
            };
            warn!(
                label,
                timeout_ms = timeout.as_millis() as u64,
                error = %err,
                "Best-effort operation timed out"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::CacheError;

    #[tokio::test]
    async fn test_success_returns_value() {
        let result =
            best_effort("ok", Duration::from_secs(1), async { Ok::<_, CacheError>(5) }).await;
        assert_eq!(result, Some(5));
    }

    #[tokio::test]
    async fn test_error_is_swallowed() {
        let result = best_effort("fails", Duration::from_secs(1), async {
            Err::<(), _>(CacheError::Unavailable {
                reason: "offline".to_string(),
            })
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_swallowed() {
        let result = best_effort("hangs", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, CacheError>(())
        })
        .await;
        assert_eq!(result, None);
    }
}
