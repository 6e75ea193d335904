use std::time::Duration;

use async_trait::async_trait;

/// Suspension point used by the pipeline driver and the execution gateway.
///
/// Production code sleeps on the tokio timer; tests swap in an implementation
/// that returns immediately so cycles can be driven without wall-clock delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
