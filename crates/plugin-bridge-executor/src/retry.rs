//! Reconnect-once retry policy.

use plugin_bridge_core::BridgeError;

/// Run `op`; on a recoverable failure run `recover` once and retry once.
///
/// Connection and stale-reference errors are recoverable. Anything else, a
/// failed recovery, or a second failure surfaces to the caller.
///
/// # Errors
/// Returns the first non-recoverable error, the recovery error, or the
/// error of the retry.
pub async fn with_single_retry<T, Op, Fut, Rec, RecFut>(
    operation: &str,
    mut op: Op,
    recover: Rec,
) -> Result<T, BridgeError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
    Rec: FnOnce() -> RecFut,
    RecFut: Future<Output = Result<(), BridgeError>>,
{
    match op().await {
        Err(e) if e.is_recoverable() => {
            tracing::warn!(operation, "Recovering once after: {e}");
            recover().await?;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    async fn run(first: BridgeError, second: Option<BridgeError>) -> (Result<u32, BridgeError>, usize, usize) {
        let calls = AtomicUsize::new(0);
        let recoveries = AtomicUsize::new(0);
        let recovered = &recoveries;
        let result = with_single_retry(
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let outcome = match (n, &second) {
                    (0, _) => Err(first.clone()),
                    (_, Some(e)) => Err(e.clone()),
                    (_, None) => Ok(7),
                };
                async move { outcome }
            },
            || async move {
                recovered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        (
            result,
            calls.load(Ordering::SeqCst),
            recoveries.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_stale_reference_retried_once() {
        let (result, calls, recoveries) =
            run(BridgeError::StaleReference("gone".into()), None).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!((calls, recoveries), (2, 1));
    }

    #[tokio::test]
    async fn test_second_failure_surfaces() {
        let (result, calls, recoveries) = run(
            BridgeError::Connection("refused".into()),
            Some(BridgeError::StaleReference("gone again".into())),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::StaleReference(_))));
        assert_eq!((calls, recoveries), (2, 1));
    }

    #[tokio::test]
    async fn test_timeout_and_execution_errors_not_retried() {
        let (result, calls, recoveries) = run(
            BridgeError::timeout("EXECUTE_CODE", std::time::Duration::from_secs(5)),
            None,
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!((calls, recoveries), (1, 0));

        let (result, calls, _) = run(BridgeError::execution("boom"), None).await;
        assert!(matches!(result, Err(BridgeError::Execution { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_failed_recovery_surfaces() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = tokio_test::block_on(with_single_retry(
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BridgeError::Connection("refused".into())) }
            },
            || async { Err(BridgeError::Connection("still refused".into())) },
        ));
        assert!(matches!(result, Err(BridgeError::Connection(ref m)) if m == "still refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
