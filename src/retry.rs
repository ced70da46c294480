//! Retry policy shared by the crawler and the downloader
//!
//! Transient failures (timeouts, connection errors, 5xx, 429) are retried with
//! exponential backoff; permanent failures are returned immediately. Every wait
//! is abandoned as soon as the cancellation token fires.

use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on a server-requested `Retry-After` wait
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped, plus jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter_span = capped_delay.saturating_mul(self.jitter_percent) / 100;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(0..=jitter_span)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }
}

/// Classification of an operation's failure
pub trait Retryable {
    /// Returns true if trying again may succeed
    fn is_transient(&self) -> bool;

    /// Server-requested wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Terminal failure of a retried operation
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    Exhausted { error: E, attempts: u32 },

    /// The operation failed with an error that is not worth retrying
    Permanent { error: E, attempts: u32 },

    /// The cancellation token fired before the operation completed
    Cancelled,
}

impl<E> RetryError<E> {
    /// The last error seen, unless the operation was cancelled
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Exhausted { error, .. } | Self::Permanent { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, exhausts `max_retries`, or is cancelled
///
/// `op` receives the 0-based attempt number. The first attempt is not delayed;
/// retry `n` waits `backoff.delay(n)`, or the error's `retry_after` if longer.
///
/// # Returns
///
/// The successful value together with the number of attempts it took.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &ExponentialBackoff,
    max_retries: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(RetryError::Permanent {
                error,
                attempts: attempt + 1,
            });
        }
        if attempt >= max_retries {
            return Err(RetryError::Exhausted {
                error,
                attempts: attempt + 1,
            });
        }

        let mut wait = backoff.delay(attempt);
        if let Some(requested) = error.retry_after() {
            wait = wait.max(requested.min(MAX_RETRY_AFTER));
        }
        tracing::debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt + 1,
            error,
            wait
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}

/// Returns true if an HTTP status is worth retrying
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Parses a numeric `Retry-After` header
///
/// HTTP-date values are ignored; the regular backoff applies instead.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Returns true if a reqwest error is a network-level failure worth retrying
pub fn is_transient_reqwest(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
