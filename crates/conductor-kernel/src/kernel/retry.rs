//! Retry: per-step retry policy and the executor that wraps one step invocation.
//!
//! **Retry loop:** the executor calls [RetryPolicy::decide] after every failed attempt and
//! stops on anything but `Retry`. `maximum_attempts` is clamped to at least 1, so the loop
//! always terminates.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::identity::NodeId;
use crate::kernel::registry::RegisteredStep;
use crate::kernel::state_machine::FailureClass;
use crate::kernel::step::{StepContext, StepError, StepOutcome};

/// Backoff and classification rules for one step.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    maximum_attempts: u32,
    /// Error types that are never retried regardless of their message.
    pub non_retryable_errors: HashSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 3,
            non_retryable_errors: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        backoff_coefficient: f64,
        maximum_interval: Duration,
        maximum_attempts: u32,
    ) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            maximum_interval,
            maximum_attempts: maximum_attempts.max(1),
            non_retryable_errors: HashSet::new(),
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO, 1)
    }

    pub fn with_non_retryable<I, S>(mut self, error_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable_errors
            .extend(error_types.into_iter().map(Into::into));
        self
    }

    pub fn maximum_attempts(&self) -> u32 {
        self.maximum_attempts
    }

    pub fn set_maximum_attempts(&mut self, attempts: u32) {
        self.maximum_attempts = attempts.max(1);
    }

    /// `min(initial * coefficient^(attempt-1), maximum)` for the 1-based attempt that failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exp);
        let secs = self.initial_interval.as_secs_f64() * factor;
        let max = self.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Decision after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &StepError, attempt: u32) -> RetryDecision {
        let class = error.class();
        if class == FailureClass::UserCancelled {
            return RetryDecision::Stop;
        }
        if self.non_retryable_errors.contains(&error.error_type)
            || matches!(
                class,
                FailureClass::NonRetryable | FailureClass::HumanReviewRequired
            )
            || attempt >= self.maximum_attempts
        {
            return RetryDecision::Fallback;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }
}

/// What to do after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Fallback,
    Stop,
}

/// Structured record of one failed step attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub node: NodeId,
    pub error_type: String,
    pub message: String,
    pub class: FailureClass,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(node: impl Into<NodeId>, error: &StepError, attempt: u32) -> Self {
        Self {
            node: node.into(),
            error_type: error.error_type.clone(),
            message: error.message.clone(),
            class: error.class(),
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn summary(&self) -> String {
        format!("{}: {}: {}", self.node, self.error_type, self.message)
    }
}

/// Hooks the executor calls so the caller can record failures and drive run state.
pub trait RetryObserver: Send + Sync {
    fn on_attempt(&self, _node: &str, _attempt: u32) {}
    fn on_failure(&self, _record: &FailureRecord) {}
    /// Called before the backoff sleep.
    fn on_retry_scheduled(&self, _record: &FailureRecord, _delay: Duration) {}
    /// Called after the backoff sleep, before the next try.
    fn on_retry_resumed(&self, _node: &str, _attempt: u32) {}
    fn on_fallback(&self, _record: &FailureRecord) {}
}

pub struct NoopRetryObserver;

impl RetryObserver for NoopRetryObserver {}

/// Successful (possibly degraded) result of a wrapped step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRun {
    pub outcome: StepOutcome,
    pub attempts: u32,
    /// True when the outcome came from the fallback.
    pub degraded: bool,
}

/// Why a wrapped step did not produce a result.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum StepFailure {
    #[error("cancelled: {}", .0.summary())]
    Cancelled(FailureRecord),
    #[error("{}", .0.summary())]
    Exhausted(FailureRecord),
    #[error("fallback failed: {} (after {})", .fallback.summary(), .original.summary())]
    FallbackFailed {
        original: FailureRecord,
        fallback: FailureRecord,
    },
}

impl StepFailure {
    /// The failure that decided the outcome.
    pub fn record(&self) -> &FailureRecord {
        match self {
            StepFailure::Cancelled(r) | StepFailure::Exhausted(r) => r,
            StepFailure::FallbackFailed { fallback, .. } => fallback,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepFailure::Cancelled(_))
    }
}

/// Wraps one step invocation with backoff, short-circuit rules and the fallback handler.
#[derive(Clone, Debug, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        step: &RegisteredStep,
        ctx: &StepContext,
        state: &Value,
        observer: &dyn RetryObserver,
    ) -> Result<StepRun, StepFailure> {
        let mut attempt: u32 = 1;
        loop {
            if ctx.is_cancelled() {
                let record = FailureRecord::new(ctx.node.clone(), &StepError::cancelled(), attempt);
                return Err(StepFailure::Cancelled(record));
            }
            observer.on_attempt(&ctx.node, attempt);
            let attempt_ctx = ctx.for_attempt(attempt);
            let error = match step.step.run(&attempt_ctx, state).await {
                Ok(outcome) => {
                    return Ok(StepRun {
                        outcome,
                        attempts: attempt,
                        degraded: false,
                    })
                }
                Err(error) => error,
            };

            let record = FailureRecord::new(ctx.node.clone(), &error, attempt);
            tracing::warn!(
                run_id = %ctx.run_id,
                node = %ctx.node,
                attempt,
                class = ?record.class,
                error = %error,
                "step attempt failed"
            );
            observer.on_failure(&record);

            match step.retry.decide(&error, attempt) {
                RetryDecision::Stop => return Err(StepFailure::Cancelled(record)),
                RetryDecision::Fallback => {
                    return self
                        .fallback(step, &attempt_ctx, state, &error, record, observer)
                        .await
                }
                RetryDecision::Retry(delay) => {
                    observer.on_retry_scheduled(&record, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    observer.on_retry_resumed(&ctx.node, attempt);
                }
            }
        }
    }

    async fn fallback(
        &self,
        step: &RegisteredStep,
        ctx: &StepContext,
        state: &Value,
        error: &StepError,
        record: FailureRecord,
        observer: &dyn RetryObserver,
    ) -> Result<StepRun, StepFailure> {
        let Some(fallback) = step.fallback.as_ref() else {
            return Err(StepFailure::Exhausted(record));
        };
        observer.on_fallback(&record);
        match fallback.recover(ctx, state, error).await {
            Ok(outcome) => {
                tracing::info!(run_id = %ctx.run_id, node = %ctx.node, "fallback applied");
                Ok(StepRun {
                    outcome,
                    attempts: record.attempt,
                    degraded: true,
                })
            }
            Err(fallback_error) => {
                let fallback_record =
                    FailureRecord::new(ctx.node.clone(), &fallback_error, record.attempt);
                observer.on_failure(&fallback_record);
                Err(StepFailure::FallbackFailed {
                    original: record,
                    fallback: fallback_record,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::kernel::step::{step_fn, FlagForReview};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(4), attempts)
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<FailureRecord>>,
        scheduled: Mutex<Vec<Duration>>,
        fallbacks: AtomicU32,
    }

    impl RetryObserver for Recorder {
        fn on_failure(&self, record: &FailureRecord) {
            self.failures.lock().unwrap().push(record.clone());
        }
        fn on_retry_scheduled(&self, _record: &FailureRecord, delay: Duration) {
            self.scheduled.lock().unwrap().push(delay);
        }
        fn on_fallback(&self, _record: &FailureRecord) {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn failing(calls: Arc<AtomicU32>, error_type: &'static str, message: &'static str) -> RegisteredStep {
        RegisteredStep::new(
            "flaky",
            step_fn(move |_ctx, _state| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::new(error_type, message))
                }
            }),
        )
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(50), 2.0, Duration::from_millis(150), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(150));
        assert_eq!(policy.delay_for(30), Duration::from_millis(150));
    }

    #[test]
    fn maximum_attempts_is_clamped() {
        let mut policy = RetryPolicy::new(Duration::ZERO, 1.0, Duration::ZERO, 0);
        assert_eq!(policy.maximum_attempts(), 1);
        policy.set_maximum_attempts(0);
        assert_eq!(policy.maximum_attempts(), 1);
    }

    #[test]
    fn decide_short_circuits_non_retryable() {
        let policy = fast_policy(5).with_non_retryable(["SchemaError"]);
        assert_eq!(
            policy.decide(&StepError::new("SchemaError", "bad output"), 1),
            RetryDecision::Fallback
        );
        assert_eq!(
            policy.decide(&StepError::new("Error", "permission denied"), 1),
            RetryDecision::Fallback
        );
        assert_eq!(
            policy.decide(&StepError::new("Error", "user cancelled"), 1),
            RetryDecision::Stop
        );
        assert!(matches!(
            policy.decide(&StepError::new("Error", "boom"), 1),
            RetryDecision::Retry(_)
        ));
    }

    #[tokio::test]
    async fn unclassified_failure_runs_exactly_n_attempts_then_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing(Arc::clone(&calls), "Error", "mystery failure")
            .with_retry(fast_policy(3))
            .with_fallback(FlagForReview);
        let recorder = Recorder::default();
        let ctx = StepContext::detached("run-1", "flaky");

        let run = RetryExecutor::new()
            .execute(&step, &ctx, &json!({}), &recorder)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(run.degraded);
        assert_eq!(run.attempts, 3);
        assert!(matches!(run.outcome, StepOutcome::Update(ref v) if v["needs_review"] == json!(true)));
        assert_eq!(recorder.failures.lock().unwrap().len(), 3);
        assert_eq!(recorder.scheduled.lock().unwrap().len(), 2);
        assert_eq!(recorder.fallbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_goes_straight_to_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing(Arc::clone(&calls), "ValidationError", "invalid rubric")
            .with_retry(fast_policy(5))
            .with_fallback(FlagForReview);
        let ctx = StepContext::detached("run-1", "flaky");
        let run = RetryExecutor::new()
            .execute(&step, &ctx, &json!({}), &NoopRetryObserver)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(run.degraded);
    }

    #[tokio::test]
    async fn without_fallback_last_failure_propagates() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing(Arc::clone(&calls), "Error", "timeout talking to model")
            .with_retry(fast_policy(2));
        let ctx = StepContext::detached("run-1", "flaky");
        let err = RetryExecutor::new()
            .execute(&step, &ctx, &json!({}), &NoopRetryObserver)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, StepFailure::Exhausted(ref r) if r.attempt == 2));
    }

    #[tokio::test]
    async fn cancellation_stops_without_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing(Arc::clone(&calls), "Error", "aborted by user")
            .with_retry(fast_policy(5))
            .with_fallback(FlagForReview);
        let ctx = StepContext::detached("run-1", "flaky");
        let err = RetryExecutor::new()
            .execute(&step, &ctx, &json!({}), &NoopRetryObserver)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
