//! # Request Retry Policy
//!
//! Decides, per failure, whether a request is reissued. The order is fixed:
//!
//! 1. A known request error is the engine's answer and is returned as-is.
//! 2. An error captured from the engine's log stream explains the failure better
//!    than the transport error and replaces it.
//! 3. A transient network failure of a read is retried while attempts remain.
//!    Once no retry is possible and a start was already refused for lack of
//!    budget, the captured-error slot is polled briefly before reporting the
//!    engine as stuck.
//! 4. Everything else is returned as-is.

use crate::config::EngineConfig;
use crate::constants::{env as env_names, limits};
use crate::error::{EngineError, EngineResult};
use std::future::Future;
use tracing::{debug, warn};

/// Retry and restart limits for one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_request_retries: u32,
    pub max_starts: u32,
}

impl RetryPolicy {
    pub fn new(no_retry: bool) -> Self {
        if no_retry {
            Self {
                max_request_retries: limits::NO_RETRY_LIMIT,
                max_starts: limits::NO_RETRY_LIMIT,
            }
        } else {
            Self {
                max_request_retries: limits::MAX_REQUEST_RETRIES,
                max_starts: limits::MAX_STARTS,
            }
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.no_retry || std::env::var_os(env_names::NO_RETRY).is_some())
    }

    /// Whether attempt `num_try` (1-based) may be followed by another
    pub fn allows_retry(&self, num_try: u32) -> bool {
        num_try <= self.max_request_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Engine-side state consulted when a request fails
pub trait AsyncErrorSource: Send + Sync {
    /// Take the error captured from the engine's log stream, clearing it
    fn take_async_error(&self) -> Option<EngineError>;

    /// A start was attempted beyond the restart budget
    fn restart_budget_exceeded(&self) -> bool;
}

/// Outcome of classifying a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry,
    Fail(EngineError),
}

pub async fn classify_request_error(
    error: EngineError,
    is_write: bool,
    num_try: u32,
    policy: &RetryPolicy,
    source: &dyn AsyncErrorSource,
) -> RetryDecision {
    if error.is_known_request() {
        return RetryDecision::Fail(error);
    }

    if let Some(captured) = source.take_async_error() {
        return RetryDecision::Fail(captured);
    }

    if error.is_transient_network() {
        if !is_write && policy.allows_retry(num_try) {
            return RetryDecision::Retry;
        }

        if source.restart_budget_exceeded() {
            for _ in 0..limits::STUCK_POLL_ATTEMPTS {
                tokio::time::sleep(limits::STUCK_POLL_INTERVAL).await;
                if let Some(captured) = source.take_async_error() {
                    return RetryDecision::Fail(captured);
                }
            }
            warn!(error = %error, "engine restart budget exceeded");
            return RetryDecision::Fail(EngineError::EngineStuck);
        }
    }

    RetryDecision::Fail(error)
}

/// Run `op` with the attempt number until it succeeds or the policy gives up
pub async fn run_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    is_write: bool,
    source: &dyn AsyncErrorSource,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut num_try = 1;
    loop {
        match op(num_try).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                match classify_request_error(error, is_write, num_try, policy, source).await {
                    RetryDecision::Retry => {
                        debug!(num_try = num_try, "retrying engine request after network failure");
                        num_try += 1;
                    }
                    RetryDecision::Fail(error) => return Err(error),
                }
            }
        }
    }
}
