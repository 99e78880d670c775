use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    sleep_until_or_cancel(Instant::now() + duration, cancel).await
}

pub async fn sleep_until_or_cancel(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep_until(deadline) => true,
    }
}
