//! Cancellation helpers
//!
//! Every network operation runs under a composite signal: the caller's
//! `CancellationToken` plus a local timeout. The two outcomes stay distinct
//! so callers can tell "gave up" from "timed out".

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("Aborted")]
    Aborted,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
}

/// Run `fut` until it completes, `cancel` fires, or `timeout` elapses.
///
/// Cancellation wins over completion when both are ready.
pub async fn abortable<F: Future>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Aborted),
        output = tokio::time::timeout(timeout, fut) => {
            output.map_err(|_| Interrupted::TimedOut(timeout))
        }
    }
}

/// Run `fut` until it completes or `cancel` fires.
pub async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Aborted),
        output = fut => Ok(output),
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), Interrupted> {
    cancellable(cancel, tokio::time::sleep(duration)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_abortable_completes() {
        let cancel = CancellationToken::new();
        let result = abortable(&cancel, Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abortable_times_out() {
        let cancel = CancellationToken::new();
        let result = abortable(
            &cancel,
            Duration::from_secs(1),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(result, Err(Interrupted::TimedOut(Duration::from_secs(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abortable_parent_cancel_is_distinct_from_timeout() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = abortable(&cancel, Duration::from_secs(10), std::future::pending::<()>()).await;

        assert_eq!(result, Err(Interrupted::Aborted));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_wins_over_ready_future() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(cancellable(&cancel, async { 1 }).await, Err(Interrupted::Aborted));
        assert_eq!(
            sleep(&cancel, Duration::from_secs(1)).await,
            Err(Interrupted::Aborted)
        );
    }
}
