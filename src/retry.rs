//! Retry executor for transient lock contention.
//!
//! Only "database locked" / "database busy" failures are retried. Everything
//! else (constraint violations, logic errors) propagates on the attempt that
//! produced it.

use crate::context::SessionContext;
use crate::core::{ErrorCode, Result, StoreError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: DEFAULT_MIN_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Doubles from `min_delay` and saturates at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.min_delay.max(Duration::from_millis(1));
        let cap = self.max_delay.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
            if backoff == cap {
                break;
            }
        }
        backoff
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Attempt bookkeeping for one unit of work.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { attempt: 0, policy }
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.attempts()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. `op` receives the 1-based attempt number.
pub async fn retry_on_locks<F, Fut, T>(
    ctx: &SessionContext,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new(*policy);
    loop {
        ctx.check()?;
        let attempt = state.begin_attempt();

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(code) = lock_contention_code(&err) else {
            return Err(err);
        };

        if state.is_exhausted() {
            return Err(StoreError::MaxRetriesReached {
                attempt,
                source: Box::new(err),
            });
        }

        backoff(ctx, &state, code, &err).await?;
    }
}

/// The engine code of a retryable failure, or `None` when `err` must not be retried.
pub(crate) fn lock_contention_code(err: &StoreError) -> Option<ErrorCode> {
    err.lock_contention_code()
}

/// Logs a retryable failure and sleeps out the backoff for the current
/// attempt. Returns early with the stop reason if the context ends first.
pub(crate) async fn backoff(
    ctx: &SessionContext,
    state: &RetryState,
    code: ErrorCode,
    err: &StoreError,
) -> Result<()> {
    if let Err(stop) = ctx.check() {
        debug!(parent: ctx.span(), error = %err, "context done, not retrying lock failure");
        return Err(stop);
    }

    let attempt = state.attempt();
    let delay = state.policy().backoff_delay(attempt);
    info!(
        parent: ctx.span(),
        error = %err,
        retry = attempt,
        code = %code,
        delay_ms = delay.as_millis() as u64,
        "database locked, sleeping then retrying"
    );

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        stop = ctx.done() => Err(stop),
    }
}
