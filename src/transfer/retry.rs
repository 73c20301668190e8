//! Retry helper for synchronous chunk delivery

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;

/// Bounded retries around one "send chunk, await reply" exchange.
///
/// A helper is built per chunk, so the budget is per chunk as well.
#[derive(Debug)]
pub struct RetryHelper {
    remaining: Mutex<u32>,
    wait_time: Duration,
}

impl RetryHelper {
    pub fn new(max_retries: u32, wait_time: Duration) -> Self {
        Self {
            remaining: Mutex::new(max_retries),
            wait_time,
        }
    }

    /// Retries left
    pub fn remaining(&self) -> u32 {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent. The last error is returned on failure.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.take_retry() => {
                    tracing::warn!(
                        "Attempt {} failed, {} retries left: {}",
                        attempt,
                        self.remaining(),
                        e
                    );
                    attempt += 1;
                    if !self.wait_time.is_zero() {
                        tokio::time::sleep(self.wait_time).await;
                    }
                }
                Err(e) => {
                    tracing::debug!("Giving up after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    fn take_retry(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}
