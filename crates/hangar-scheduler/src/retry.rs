//! Exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use hangar_config::RetryConfig;
use hangar_core::capacity::{ProviderError, ProviderResult};
use tracing::warn;

use crate::error::AllocationError;

/// Retries transient provider errors with a doubling, capped delay.
/// Every other error is returned immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, AllocationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Transient(message)) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ProviderError::Transient(message)) => {
                    return Err(AllocationError::Transient {
                        attempts: attempt,
                        message,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay, config.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
