//! Cancellable timers shared by schedules, delays and retry backoff

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Sleep for `delay`. Returns `false` if `token` was cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            trace!("Timer cancelled before firing");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `on_fire` after `delay` unless `token` is cancelled first
pub(crate) fn arm_after<F, Fut>(
    token: &CancellationToken,
    delay: Duration,
    on_fire: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = token.clone();
    tokio::spawn(async move {
        if sleep_or_cancel(&token, delay).await {
            on_fire().await;
        }
    })
}

/// Time from now until `at`, zero when `at` has passed
pub(crate) fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let handle = arm_after(&token, Duration::from_millis(100), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let handle = arm_after(&token, Duration::from_secs(60), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        token.cancel();
        handle.await.unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_delay_until_past_is_zero() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(delay_until(past), Duration::ZERO);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert!(delay_until(future) > Duration::from_secs(4));
    }
}
