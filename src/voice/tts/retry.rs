//! Retry with exponential backoff for TTS provider calls

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Retry policy for TTS provider calls
///
/// Controls how many times a failed request is retried and how
/// long to wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Deadline for one attempt
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Whether an HTTP status is worth retrying
#[must_use]
pub fn is_recoverable(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Map a failed HTTP response onto a synthesis error
///
/// 5xx is transient. Any 4xx (including 429) is an auth/quota failure and
/// is never retried.
#[must_use]
pub fn classify_status(provider: &str, status: u16, body: &str) -> Error {
    let kind = if is_recoverable(status) {
        SynthesisErrorKind::Transient
    } else if (400..500).contains(&status) {
        SynthesisErrorKind::AuthOrQuota
    } else {
        SynthesisErrorKind::Protocol
    };

    let body = body.trim();
    let body = body.char_indices().nth(200).map_or(body, |(i, _)| &body[..i]);
    Error::synthesis(kind, format!("{provider} error {status}: {body}"))
}

/// Map a transport failure onto a synthesis error
#[must_use]
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> Error {
    let kind = if err.is_builder() {
        SynthesisErrorKind::Protocol
    } else {
        SynthesisErrorKind::Transient
    };
    Error::synthesis(kind, format!("{provider} request failed: {err}"))
}

/// Compute the delay before the next retry attempt.
///
/// `min(base_delay * 2^attempt + jitter, max_delay)`, with 0-25% jitter
/// derived from `SystemTime` to avoid pulling in a random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails for good, or `cancel` fires
///
/// Only [`SynthesisErrorKind::Transient`] failures are retried. Each attempt
/// is bounded by `policy.request_timeout`.
///
/// # Errors
///
/// Returns the last failure, or [`Error::Cancelled`]
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    provider: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(policy.request_timeout, op()) => {
                result.unwrap_or_else(|_| {
                    Err(Error::synthesis(
                        SynthesisErrorKind::Transient,
                        format!("{provider} request timed out after {:?}", policy.request_timeout),
                    ))
                })
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e)
                if e.synthesis_kind() == Some(SynthesisErrorKind::Transient)
                    && attempt < policy.max_retries =>
            {
                let delay = delay_for_attempt(policy, attempt);
                attempt += 1;
                tracing::warn!(
                    provider,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "transient synthesis failure, retrying"
                );

                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
