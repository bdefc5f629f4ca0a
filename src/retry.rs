//! Backoff and optimistic-concurrency retry helpers
//!
//! Reconciliation itself never retries backing-system calls; the controller's
//! requeue policy does that. These helpers cover the two places where a local
//! retry is the right answer: startup calls against the API server, and
//! status writes that lose an optimistic-concurrency race.
//!
//! # Example
//!
//! ```ignore
//! use tapms::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::with_max_attempts(5), "update_status", || async {
//!     let latest = store.get(&namespace, &name).await?;
//!     store.replace_status(&latest, status.clone()).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff settings for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Config that retries until success
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Run `operation` until it succeeds, retrying every failure with jittered backoff
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(config, operation_name, |_| true, operation).await
}

/// Run `operation`, retrying only while it fails with a 409 conflict
///
/// The operation must re-read the latest object on every attempt; replaying
/// a stale write would conflict forever.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_when(config, operation_name, Error::is_conflict, operation).await
}

/// Run `operation`, retrying failures accepted by `should_retry`
///
/// Errors rejected by `should_retry` are returned immediately, as is the
/// last error once `max_attempts` is reached.
pub async fn retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed after max retries"
            );
            return Err(e);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "operation failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
