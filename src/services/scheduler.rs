// src/services/scheduler.rs

//! Bounded, retrying, cancellable execution of fetches.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{RetryConfig, WorkUnit};
use crate::services::fetcher::{ApiRequest, FetchError, Fetcher, IsRetryable};

/// Limits and retry policy of a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fetches allowed in flight at once
    pub max_concurrent: usize,
    /// Attempts per unit, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub rate_limit_multiplier: f64,
}

impl SchedulerConfig {
    pub fn new(max_concurrent: usize, retry: &RetryConfig) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_attempts: retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            backoff_multiplier: retry.backoff_multiplier,
            jitter: retry.jitter,
            rate_limit_multiplier: retry.rate_limit_multiplier,
        }
    }

    /// Delay before attempt `attempt + 1`, jitter not included.
    ///
    /// A product that is not a representable duration becomes `max_delay`.
    pub fn backoff_delay(&self, attempt: u32, error: &FetchError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let base = Duration::try_from_secs_f64(base)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        match error {
            FetchError::RateLimited { retry_after } => {
                let scaled =
                    Duration::try_from_secs_f64(base.as_secs_f64() * self.rate_limit_multiplier)
                        .unwrap_or(self.max_delay);
                retry_after.map_or(scaled, |server| server.max(scaled))
            }
            _ => base,
        }
    }
}

/// A unit that could not be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalFailure {
    pub error: FetchError,
    pub attempts: u32,
}

/// Result of [`Scheduler::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failed(TerminalFailure),
    /// The run was cancelled before the unit could be fetched.
    Cancelled,
}

/// Runs fetches under a concurrency bound with retry and backoff.
pub struct Scheduler {
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: SchedulerConfig, cancel: CancellationToken) -> Self {
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            cancel,
        }
    }

    /// Fetch `request` on behalf of `unit`, retrying transient failures.
    ///
    /// A permit is held only while an attempt is in flight, never across a
    /// backoff sleep. Once cancelled, no new attempt starts and pending
    /// backoffs end early with [`Outcome::Cancelled`].
    pub async fn submit(&self, unit: &WorkUnit, request: &ApiRequest) -> Outcome {
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                permit = self.permits.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Outcome::Cancelled,
                },
            };

            attempt += 1;
            let result = self.fetcher.fetch(request).await;
            drop(permit);

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("{} succeeded after {} attempts", unit, attempt);
                    }
                    return Outcome::Success(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.config.max_attempts {
                return Outcome::Failed(TerminalFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.config.backoff_delay(attempt, &error);
            let delay = if self.config.jitter {
                add_jitter(delay)
            } else {
                delay
            };

            log::warn!(
                "{} ({}) failed on attempt {}/{}: {}; retrying in {:?}",
                unit,
                request,
                attempt,
                self.config.max_attempts,
                error,
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Stretch `delay` by a uniform random 0-100%.
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + factor)).unwrap_or(delay)
}
