//! Retry executor.
//!
//! Every store call made by the engine goes through [`with_retry`]. Failures are classified
//! by the store boundary ([`StoreError::is_transient`]): permanent failures return at once,
//! transient ones are retried up to the policy bound and then surface as
//! [`EngineError::RetriesExhausted`] carrying the last store error unchanged.
//!
//! A [`CallContext`] carries an optional deadline and a cancellation flag. Both are checked
//! before each attempt and before each backoff sleep, and store clients check them before
//! going to the network.

use crate::constants::DEFAULT_RETRY_ATTEMPTS;
use crate::store::{StoreError, StoreResult};
use crate::{EngineError, EngineResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// `initial`, doubled after each failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Bounded-attempt retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` below one is raised to one.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Handle used to cancel every call made with a [`CallContext`].
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Deadline and cancellation state threaded through every store call.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    /// A context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails if the context has been cancelled or its deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] or [`StoreError::DeadlineExceeded`].
    pub fn check(&self) -> StoreResult<()> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.remaining() == Some(Duration::ZERO) {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Runs `operation` under `policy`.
///
/// # Arguments
///
/// * `policy` - attempt bound and backoff.
/// * `ctx` - deadline and cancellation, checked before each attempt and sleep.
/// * `what` - short label for log lines (`"search Patient"`).
/// * `operation` - the store call.
///
/// # Errors
///
/// - [`EngineError::Store`] for a permanent failure, a cancellation or a passed deadline.
/// - [`EngineError::RetriesExhausted`] when every attempt failed transiently.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    ctx: &CallContext,
    what: &str,
    mut operation: impl FnMut() -> StoreResult<T>,
) -> EngineResult<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        ctx.check()?;

        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(EngineError::Store(err)),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            tracing::warn!(what, attempts = attempt, error = %err, "store call retries exhausted");
            return Err(EngineError::RetriesExhausted {
                attempts: attempt,
                last: err,
            });
        }
        tracing::debug!(what, attempt, error = %err, "transient store failure; retrying");

        let delay = policy.delay_after(attempt);
        if !delay.is_zero() {
            ctx.check()?;
            let delay = ctx.remaining().map_or(delay, |left| delay.min(left));
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn transient() -> StoreError {
        StoreError::Transient("503 Service Unavailable".into())
    }

    #[test]
    fn succeeds_on_third_attempt() {
        let calls = Cell::new(0);
        let result = with_retry(&RetryPolicy::default(), &CallContext::new(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(transient())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.expect("third attempt succeeds"), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn three_transient_failures_exhaust_the_policy() {
        let calls = Cell::new(0);
        let result: EngineResult<()> =
            with_retry(&RetryPolicy::default(), &CallContext::new(), "test", || {
                calls.set(calls.get() + 1);
                Err(transient())
            });
        match result {
            Err(EngineError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, StoreError::Transient(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let result: EngineResult<()> =
            with_retry(&RetryPolicy::default(), &CallContext::new(), "test", || {
                calls.set(calls.get() + 1);
                Err(StoreError::Permanent {
                    status: Some(422),
                    diagnostics: "invalid resource".into(),
                })
            });
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::Permanent { .. }))
        ));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cancelled_context_makes_no_attempt() {
        let ctx = CallContext::new();
        ctx.cancel_handle().cancel();
        let calls = Cell::new(0);
        let result: EngineResult<()> = with_retry(&RetryPolicy::default(), &ctx, "test", || {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::Store(StoreError::Cancelled))));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn passed_deadline_stops_retrying() {
        let ctx = CallContext::with_deadline(Instant::now());
        let result: EngineResult<()> =
            with_retry(&RetryPolicy::default(), &ctx, "test", || Err(transient()));
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::DeadlineExceeded))
        ));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(
            5,
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(250),
            },
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
        assert_eq!(RetryPolicy::default().delay_after(2), Duration::ZERO);
        assert_eq!(RetryPolicy::new(0, Backoff::None).max_attempts(), 1);
    }

    #[test]
    fn backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(
            2,
            Backoff::Exponential {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(20),
            },
        );
        let started = Instant::now();
        let _ = with_retry::<()>(&policy, &CallContext::new(), "test", || Err(transient()));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
