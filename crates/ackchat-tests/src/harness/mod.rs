pub mod client;
pub mod server;

use std::future::Future;
use std::time::Duration;

/// Default deadline for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns true, or timeout. Returns the last result.
pub async fn poll_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("ackchat=debug,ackchat_server=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
