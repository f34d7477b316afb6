//! Retry classification for store operations.
//!
//! A [`RetryPolicy`] is an ordered list of `(predicate, action)` rules over
//! [`ErrorKind`]. The first matching rule decides what happens to a failure;
//! kinds no rule matches fall back to [`RetryAction::RetryFixed`].

use rand::{Rng, thread_rng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use cirrus_core::emit;
use cirrus_core::metrics::events::OperationRetried;

use crate::config::RetryConfig;
use crate::error::{CommitError, ErrorKind, StorageError};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Never retry.
    FailFast,
    /// Retry after a fixed delay, but only for idempotent operations.
    RetryFixed,
    /// Retry with a delay growing with the attempt number, regardless of
    /// idempotency. Used for throttling, where the request was rejected whole.
    RetryBackoff,
}

/// Whether repeating an operation is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NotIdempotent,
}

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Fail,
    RetryAfter(Duration),
}

/// Errors that can be classified for retry.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        StorageError::kind(self)
    }
}

impl Classify for CommitError {
    fn kind(&self) -> ErrorKind {
        CommitError::kind(self)
    }
}

type Predicate = Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>;

#[derive(Clone)]
struct RetryRule {
    matches: Predicate,
    action: RetryAction,
}

/// Ordered retry rules plus attempt limit and base delay.
#[derive(Clone)]
pub struct RetryPolicy {
    rules: Vec<RetryRule>,
    limit: usize,
    interval: Duration,
    jitter_fraction: f64,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("rules", &self.rules.len())
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// The standard table.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::empty(config.limit, Duration::from_millis(config.interval_ms))
            .with_jitter(config.jitter)
            .rule(
                |kind| {
                    matches!(
                        kind,
                        ErrorKind::UnknownHost
                            | ErrorKind::NoRoute
                            | ErrorKind::Interrupted
                            | ErrorKind::BadRequest
                            | ErrorKind::NotFound
                            | ErrorKind::AlreadyExists
                            | ErrorKind::PermissionDenied
                            | ErrorKind::Unsupported
                            | ErrorKind::Validation
                    )
                },
                RetryAction::FailFast,
            )
            .rule(|kind| kind == ErrorKind::Throttled, RetryAction::RetryBackoff)
            .rule(|kind| kind == ErrorKind::Io, RetryAction::RetryFixed)
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::empty(0, Duration::ZERO)
    }

    /// A policy with no rules.
    pub fn empty(limit: usize, interval: Duration) -> Self {
        Self {
            rules: Vec::new(),
            limit,
            interval,
            jitter_fraction: 0.0,
        }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn rule<F>(mut self, matches: F, action: RetryAction) -> Self
    where
        F: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.rules.push(RetryRule {
            matches: Arc::new(matches),
            action,
        });
        self
    }

    /// Insert a rule ahead of all existing ones.
    pub fn override_rule<F>(mut self, matches: F, action: RetryAction) -> Self
    where
        F: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(
            0,
            RetryRule {
                matches: Arc::new(matches),
                action,
            },
        );
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The action for a failure kind.
    pub fn action_for(&self, kind: ErrorKind) -> RetryAction {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(kind))
            .map(|rule| rule.action)
            .unwrap_or(RetryAction::RetryFixed)
    }

    /// Decide what to do after `retries` earlier retries of an operation.
    pub fn decide(&self, kind: ErrorKind, retries: usize, idempotency: Idempotency) -> RetryDecision {
        if retries >= self.limit {
            return RetryDecision::Fail;
        }
        match self.action_for(kind) {
            RetryAction::FailFast => RetryDecision::Fail,
            RetryAction::RetryFixed if idempotency == Idempotency::NotIdempotent => {
                RetryDecision::Fail
            }
            RetryAction::RetryFixed => RetryDecision::RetryAfter(self.interval),
            RetryAction::RetryBackoff => {
                let raw = self.interval.saturating_mul(retries as u32 + 1);
                RetryDecision::RetryAfter(self.jittered(raw))
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() || self.jitter_fraction <= 0.0 {
            return delay;
        }
        let min = 1.0 - self.jitter_fraction;
        let max = 1.0 + self.jitter_fraction;
        let factor = thread_rng().gen_range(min..=max);
        Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
    }

    /// Run `op` until it succeeds or the policy gives up.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        idempotency: Idempotency,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind = err.kind();
                    match self.decide(kind, retries, idempotency) {
                        RetryDecision::Fail => return Err(err),
                        RetryDecision::RetryAfter(delay) => {
                            retries += 1;
                            warn!(
                                operation,
                                kind = kind.as_str(),
                                retry = retries,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying after failure: {err}"
                            );
                            emit!(OperationRetried {
                                operation,
                                kind: kind.as_str(),
                            });
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }
}
