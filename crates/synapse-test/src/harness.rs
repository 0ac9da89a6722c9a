//! Async helpers for timing-dependent assertions.

use std::time::Duration;

/// Default time budget for waiting on asynchronous deliveries.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` every few milliseconds until it holds or `limit`
/// elapses. Returns whether it held.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let poll = async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(limit, poll).await.is_ok()
}

/// Let already-scheduled tasks run for `period`, then return.
pub async fn settle(period: Duration) {
    tokio::time::sleep(period).await;
}

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
