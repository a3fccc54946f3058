//! Retry logic with exponential backoff

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::Result;
use crate::config::RetryConfig;
use crate::transport::{HttpClient, OriginResponse, OutboundRequest, fetch_with_timeout};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
        }
    }

    /// Fresh delay schedule for one logical call.
    ///
    /// Yields `initial_delay * backoff_factor^n` clamped to `max_delay`, at most
    /// `max_retries` times. Never shared between calls.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let max_times = if self.enabled {
            self.max_retries as usize
        } else {
            0
        };
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.backoff_factor)
            .with_max_times(max_times)
            .build()
    }

    /// Longest a fully failing call can take with `timeout` per attempt
    #[must_use]
    pub fn worst_case_latency(&self, timeout: Duration) -> Duration {
        let backoff: Duration = self.backoff().sum();
        let attempts = if self.enabled { self.max_retries + 1 } else { 1 };
        timeout * attempts + backoff
    }
}

/// Issue a request with per-attempt timeout and bounded retry.
///
/// A response with status >= 500 or a failed attempt is retried while the
/// budget lasts; anything below 500 is returned at once. When the budget runs
/// out the last outcome is returned as-is, either the final 5xx response or
/// the final error.
///
/// The timeout applies to each attempt, not to the whole chain; callers size
/// their outer deadline with [`RetryPolicy::worst_case_latency`].
///
/// # Errors
///
/// Returns the last transport error once retries are exhausted.
pub async fn fetch_with_retry(
    client: &dyn HttpClient,
    request: &OutboundRequest,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<OriginResponse> {
    let mut delays = policy.backoff();
    let mut attempt = 0u32;

    loop {
        let outcome = fetch_with_timeout(client, request.clone(), timeout).await;

        let retryable = match &outcome {
            Ok(response) => response.status.is_server_error(),
            Err(e) => e.is_retryable(),
        };
        if !retryable {
            return outcome;
        }

        let Some(delay) = delays.next() else {
            debug!(url = %request.url, attempts = attempt + 1, "Max retry attempts reached");
            return outcome;
        };

        attempt += 1;
        match &outcome {
            Ok(response) => debug!(
                url = %request.url,
                attempt,
                status = response.status.as_u16(),
                delay_ms = delay.as_millis(),
                "Retrying after server error"
            ),
            Err(e) => debug!(
                url = %request.url,
                attempt,
                error = %e,
                delay_ms = delay.as_millis(),
                "Retrying after failed attempt"
            ),
        }
        sleep(delay).await;
    }
}
