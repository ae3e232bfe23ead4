//! Retry utilities with configurable backoff and jitter strategies.
//!
//! A [`RetryPolicy`] pairs a [`RetryConfig`] with the set of error classes it
//! retries. The orchestrator owns retry decisions; leaf components only
//! classify their errors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::{ArtifactStoreError, ErrorClass, PublishError};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// State tracking for retry operations.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: u32,
    /// Previous delays for decorrelated jitter.
    previous_delays: HashMap<String, u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that an attempt was made.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns true if no attempts remain.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempts >= config.max_attempts
    }

    /// Calculates the delay before the next attempt.
    #[must_use]
    pub fn calculate_delay(&mut self, key: &str, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        // Zero-based index of the retry about to happen.
        let retry = self.attempts.saturating_sub(1);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delays.get(key).copied().unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let new_delay = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delays.insert(key.to_string(), new_delay);
                new_delay
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts, give up.
    GiveUp,
    /// The error class is not retried by this policy.
    NotRetryable,
}

/// Anything that can report an [`ErrorClass`].
pub trait Classify {
    /// Returns the error classification.
    fn class(&self) -> ErrorClass;
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        PublishError::class(self)
    }
}

impl Classify for ArtifactStoreError {
    fn class(&self) -> ErrorClass {
        ArtifactStoreError::class(self)
    }
}

/// A bounded retry policy keyed on error class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt bound and delay shape.
    pub config: RetryConfig,
    /// Classes this policy retries.
    pub retry_on: HashSet<ErrorClass>,
}

impl RetryPolicy {
    /// Retries transient failures according to `config`.
    #[must_use]
    pub fn transient(config: RetryConfig) -> Self {
        Self {
            config,
            retry_on: [ErrorClass::Transient].into_iter().collect(),
        }
    }

    /// Never retries: exactly one attempt.
    #[must_use]
    pub fn never() -> Self {
        Self {
            config: RetryConfig::new().with_max_attempts(1),
            retry_on: HashSet::new(),
        }
    }

    /// Decides what to do after an attempt failed with `class`.
    ///
    /// `state.attempts` must already include the failed attempt.
    #[must_use]
    pub fn decide(&self, state: &mut RetryState, key: &str, class: ErrorClass) -> RetryDecision {
        if !self.retry_on.contains(&class) {
            return RetryDecision::NotRetryable;
        }
        if state.is_exhausted(&self.config) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(state.calculate_delay(key, &self.config))
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The last error after the attempt bound was reached.
    Exhausted {
        /// The last error.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
    /// The error class is not retried.
    NotRetryable {
        /// The error.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
    /// The token was cancelled while backing off.
    Cancelled {
        /// The cancellation reason.
        reason: String,
        /// The error that triggered the backoff.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
}

impl<E> RetryFailure<E> {
    /// The error that ended the loop.
    pub fn into_error(self) -> E {
        match self {
            Self::Exhausted { error, .. }
            | Self::NotRetryable { error, .. }
            | Self::Cancelled { error, .. } => error,
        }
    }

    /// Attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::NotRetryable { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Sleeps for `delay` unless `token` is cancelled first.
///
/// Returns false if the sleep was cut short by cancellation.
pub async fn sleep_unless_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = token.cancelled() => false,
    }
}

/// Executes an operation under `policy`, backing off between attempts.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    token: &CancellationToken,
    operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    with_retry_notify(policy, key, token, |_, _, _| {}, operation).await
}

/// Like [`with_retry`], calling `on_retry(attempt, delay, error)` before
/// each backoff.
pub async fn with_retry_notify<T, E, F, Fut, N>(
    policy: &RetryPolicy,
    key: &str,
    token: &CancellationToken,
    mut on_retry: N,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
    N: FnMut(u32, Duration, &E),
{
    let mut state = RetryState::new();

    loop {
        let attempt = state.attempts + 1;
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                state.record_attempt();
                match policy.decide(&mut state, key, e.class()) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            key = %key,
                            attempt = state.attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retrying after error"
                        );
                        on_retry(state.attempts, delay, &e);
                        if !sleep_unless_cancelled(delay, token).await {
                            return Err(RetryFailure::Cancelled {
                                reason: token.reason().unwrap_or_default(),
                                error: e,
                                attempts: state.attempts,
                            });
                        }
                    }
                    RetryDecision::GiveUp => {
                        return Err(RetryFailure::Exhausted {
                            error: e,
                            attempts: state.attempts,
                        });
                    }
                    RetryDecision::NotRetryable => {
                        return Err(RetryFailure::NotRetryable {
                            error: e,
                            attempts: state.attempts,
                        });
                    }
                }
            }
        }
    }
}
