//! Shared helpers for the integration tests

use std::time::Duration;

/// Poll `cond` until it holds or `timeout` elapses
pub async fn wait_until<F>(cond: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cond()
}

/// Settling time for in-flight asynchronous deliveries
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
