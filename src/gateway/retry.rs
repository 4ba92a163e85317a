// Retry policy for remote store calls.
// Off by default: a retried mutation is a second logical attempt against a
// store that offers no dedup guarantee.

use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use super::errors::GatewayError;
use crate::config::RetrySettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retries(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::none()
        }
    }

    /// Delays between attempts: base, 2×base, 4×base, … capped at `max_delay`.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay.as_millis().max(1) as u64)
            .map(move |delay| (delay / 2).min(max_delay))
            .take(self.max_retries as usize)
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent. `attempt` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt_number = 0u32;
        let max_retries = self.max_retries;

        RetryIf::spawn(
            self.delays(),
            || {
                attempt_number += 1;
                if attempt_number > 1 {
                    debug!(attempt = attempt_number, "Retrying remote call");
                }
                attempt(attempt_number)
            },
            |error: &GatewayError| {
                let retry = error.is_retryable() && max_retries > 0;
                if retry {
                    warn!(error = %error, "Remote call failed (retryable)");
                }
                retry
            },
        )
        .await
    }
}
