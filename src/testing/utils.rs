//! Polling helpers for async tests.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Repeatedly run `action` until `predicate` accepts its output or `timeout` elapses.
pub(crate) async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let value = action().await;
        if predicate(&value) {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_result_returns_first_accepted_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = wait_for_result(
            || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) + 1 }
            },
            |value| *value >= 3,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn test_wait_for_result_times_out() {
        let result = wait_for_result(|| async { 0u32 }, |value| *value > 0, Duration::from_millis(30)).await;
        assert_eq!(result, None);
    }
}
