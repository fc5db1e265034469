//! Outbound HTTP with a bounded retry policy.
//!
//! Network errors, timeouts, 429 and 5xx responses are retried with
//! doubling backoff. Other statuses come back on the first attempt. When
//! attempts run out the last response is returned as-is, but a network
//! error on the last attempt propagates.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::channels::channel::ChannelKind;
use crate::config::env_or;
use crate::error::ChannelError;

/// Retry and timeout settings shared by every provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub base_delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("TASKDESK_HTTP_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_delay: Duration::from_millis(env_or(
                "TASKDESK_HTTP_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            timeout: Duration::from_secs(env_or(
                "TASKDESK_HTTP_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(16))
    }
}

/// Statuses worth another attempt.
pub fn should_retry_status(status: u16) -> bool {
    status == 429 || status >= 500
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Build the shared client.
pub fn build_client(policy: &RetryPolicy) -> Result<reqwest::Client, ChannelError> {
    reqwest::Client::builder()
        .timeout(policy.timeout)
        .build()
        .map_err(|e| ChannelError::RequestFailed {
            name: "http".into(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

/// Send a request built by `build`, retrying per `policy`.
///
/// `build` is called once per attempt because a sent request cannot be
/// reused.
pub async fn send_with_retry<F>(
    channel: ChannelKind,
    policy: &RetryPolicy,
    build: F,
) -> Result<reqwest::Response, ChannelError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let last = attempt + 1 >= attempts;
        match build().timeout(policy.timeout).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if last || !should_retry_status(status) {
                    return Ok(resp);
                }
                warn!(channel = %channel, status, attempt = attempt + 1, "Retryable HTTP status");
            }
            Err(e) => {
                if last || !is_retryable_error(&e) {
                    return Err(ChannelError::RequestFailed {
                        name: channel.to_string(),
                        reason: e.to_string(),
                    });
                }
                warn!(channel = %channel, error = %e, attempt = attempt + 1, "HTTP request failed, retrying");
            }
        }
        let delay = policy.backoff(attempt);
        debug!(channel = %channel, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Turn a non-2xx response into `ChannelError::Http`.
pub async fn ensure_success(
    channel: ChannelKind,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ChannelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ChannelError::Http {
        name: channel.to_string(),
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

/// Check the status and decode a JSON body.
pub async fn read_json<T: DeserializeOwned>(
    channel: ChannelKind,
    resp: reqwest::Response,
) -> Result<T, ChannelError> {
    let resp = ensure_success(channel, resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ChannelError::InvalidPayload {
            name: channel.to_string(),
            reason: e.to_string(),
        })
}
