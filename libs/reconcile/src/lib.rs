//! Convergence primitives for eventually-consistent provider operations.
//!
//! Cloud mutations are accepted immediately but complete asynchronously.
//! This library provides the poll-with-backoff loop used to observe them:
//!
//! - **Poll function**: one observation, returning [`PollOutcome`].
//! - **Backoff**: initial delay, multiplier and an attempt budget.
//! - **Context**: what is being waited on, carried into the timeout error.
//!
//! # Invariants
//!
//! - The poll function is invoked at most `max_attempts` times
//! - `Done` and `Failed` stop the loop immediately
//! - No sleep follows the final attempt
//! - Every timeout error is built fresh from the caller's context

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Convergence errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Attempt budget exhausted before the target state was observed.
    #[error(
        "timed out after {attempts} attempts waiting for {operation} \
         (region: {region}, resources: [{resources}], target: {target})",
        resources = resources.join(", ")
    )]
    Timeout {
        operation: String,
        region: String,
        resources: Vec<String>,
        target: String,
        attempts: u32,
    },

    /// The observed operation reached a terminal failure state.
    #[error("{operation} failed (region: {region}, resources: [{resources}]): {reason}", resources = resources.join(", "))]
    TerminalFailure {
        operation: String,
        region: String,
        resources: Vec<String>,
        reason: String,
    },
}

impl ReconcileError {
    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Resource identifiers the failed wait was observing.
    pub fn resources(&self) -> &[String] {
        match self {
            Self::Timeout { resources, .. } | Self::TerminalFailure { resources, .. } => resources,
        }
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// Not there yet; poll again after the next delay.
    Pending,

    /// Target state observed.
    Done(T),

    /// Terminal failure; stop polling.
    Failed(String),
}

impl<T> PollOutcome<T> {
    /// Returns true for `Done`.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Backoff policy for a wait loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first unsuccessful attempt.
    pub initial: Duration,

    /// Multiplier applied to the delay after every attempt.
    pub factor: f64,

    /// Total number of poll invocations allowed.
    pub max_attempts: u32,

    /// Upper bound for a single delay.
    pub cap: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        DEFAULT_BACKOFF
    }
}

impl Backoff {
    /// Constant-interval backoff.
    pub const fn constant(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial: interval,
            factor: 1.0,
            max_attempts,
            cap: None,
        }
    }

    /// Delay to sleep after the given 0-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0).powi(attempt as i32);
        let secs = self.initial.as_secs_f64() * factor;
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Worst-case time spent sleeping across the whole budget.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Identifying context of a wait, copied into any error it produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitContext {
    /// Operation name (e.g. `instance-status`, `task-result`).
    pub operation: String,

    /// Provider region.
    pub region: String,

    /// Resource identifiers being observed.
    pub resources: Vec<String>,

    /// Expected target state.
    pub target: String,
}

impl WaitContext {
    /// Create a context for an operation in a region.
    pub fn new(operation: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            region: region.into(),
            ..Self::default()
        }
    }

    /// Attach the observed resource identifiers.
    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.resources = resources.into_iter().map(|r| r.to_string()).collect();
        self
    }

    /// Attach the expected target state.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    fn timeout(self, attempts: u32) -> ReconcileError {
        ReconcileError::Timeout {
            operation: self.operation,
            region: self.region,
            resources: self.resources,
            target: self.target,
            attempts,
        }
    }

    fn failure(self, reason: String) -> ReconcileError {
        ReconcileError::TerminalFailure {
            operation: self.operation,
            region: self.region,
            resources: self.resources,
            reason,
        }
    }
}

/// Poll until `Done`, `Failed`, or the attempt budget is exhausted.
///
/// The first attempt runs immediately; subsequent attempts follow the
/// backoff delays. A budget of zero is treated as one attempt.
pub async fn wait_for<T, F, Fut>(
    backoff: &Backoff,
    context: WaitContext,
    mut poll: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    let max_attempts = backoff.max_attempts.max(1);

    for attempt in 0..max_attempts {
        match poll().await {
            PollOutcome::Done(value) => {
                debug!(
                    operation = %context.operation,
                    attempts = attempt + 1,
                    "Wait converged"
                );
                return Ok(value);
            }
            PollOutcome::Failed(reason) => {
                warn!(
                    operation = %context.operation,
                    region = %context.region,
                    reason = %reason,
                    "Wait reached terminal failure"
                );
                return Err(context.failure(reason));
            }
            PollOutcome::Pending => {
                if attempt + 1 < max_attempts {
                    let delay = backoff.delay(attempt);
                    debug!(
                        operation = %context.operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Not converged yet"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    warn!(
        operation = %context.operation,
        region = %context.region,
        attempts = max_attempts,
        "Wait budget exhausted"
    );
    Err(context.timeout(max_attempts))
}

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff: 30s constant interval, five attempts.
pub const DEFAULT_BACKOFF: Backoff = Backoff::constant(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_ATTEMPTS);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> Backoff {
        Backoff::constant(Duration::from_millis(1), max_attempts)
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_attempts: 5,
            cap: Some(Duration::from_secs(5)),
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(5));
    }

    #[test]
    fn test_default_backoff_budget() {
        let backoff = Backoff::default();
        assert_eq!(backoff.max_attempts, 5);
        // Four sleeps between five attempts.
        assert_eq!(backoff.total_delay(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_done_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result = wait_for(&fast(5), WaitContext::new("task-result", "r"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::Done(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_on_third_call() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            wait_for(&fast(10), WaitContext::new("task-result", "r"), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        PollOutcome::Failed("task failed".to_string())
                    } else {
                        PollOutcome::Pending
                    }
                }
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            ReconcileError::TerminalFailure { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_times_out_with_context() {
        let calls = AtomicU32::new(0);
        let context = WaitContext::new("instance-status", "ap-guangzhou")
            .with_resources(["ins-a", "ins-b"])
            .with_target("RUNNING");

        let result: Result<(), _> = wait_for(&fast(4), context, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::Pending }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.resources(), ["ins-a", "ins-b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let message = err.to_string();
        assert!(message.contains("ap-guangzhou"));
        assert!(message.contains("RUNNING"));
        assert!(message.contains("ins-a, ins-b"));
    }

    #[tokio::test]
    async fn test_zero_budget_still_polls_once() {
        let calls = AtomicU32::new(0);
        let _ = wait_for::<(), _, _>(&fast(0), WaitContext::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::Pending }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
