//! Step capability: the pluggable unit of work a graph node invokes.
//!
//! The engine never inspects what a step does. A step receives the current run state and
//! a [StepContext], and returns a state patch, a partial result, or an interrupt request.
//! External calls go through [StepContext::external_call] / [StepContext::fan_out] so the
//! per-run external-call bound applies.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::kernel::event::{EventDraft, EventEmitter, EventKind, KernelError};
use crate::kernel::identity::{NodeId, RunId};
use crate::kernel::interrupt::Signal;
use crate::kernel::state_machine::{classify_failure, FailureClass};

/// What a step produced.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// JSON object patch, shallow-merged into the run state.
    Update(Value),
    /// Usable result with some failed sub-items; the run moves to PARTIAL_FAILED.
    Partial { update: Value, failures: Vec<String> },
    /// Suspend the run here until an external event arrives.
    Interrupt(Value),
}

/// Suspend execution at the current node with `payload` for the human/external actor.
pub fn interrupt(payload: Value) -> StepOutcome {
    StepOutcome::Interrupt(payload)
}

/// Error returned by a step. Classification comes from the error type and message text.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct StepError {
    pub error_type: String,
    pub message: String,
}

impl StepError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new("Cancelled", "run cancelled by user")
    }

    pub fn class(&self) -> FailureClass {
        classify_failure(&format!("{} {}", self.error_type, self.message))
    }
}

/// Cooperative cancellation flag shared between the facade and a running step.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held for the duration of one external call; releases its slot on drop.
pub struct CallPermit {
    _guard: Box<dyn Send + Sync>,
}

impl CallPermit {
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Gate enforcing the per-run external-call bound.
#[async_trait]
pub trait CallGate: Send + Sync {
    async fn acquire(&self, run_id: &RunId) -> Result<CallPermit, KernelError>;
}

/// Gate without a bound (tests, single-call steps).
pub struct UnboundedCallGate;

#[async_trait]
impl CallGate for UnboundedCallGate {
    async fn acquire(&self, _run_id: &RunId) -> Result<CallPermit, KernelError> {
        Ok(CallPermit::new(()))
    }
}

/// Emitter that drops everything.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _run_id: &RunId, _draft: EventDraft) -> Result<u64, KernelError> {
        Ok(0)
    }
}

/// Per-invocation context handed to a step.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node: NodeId,
    /// 1-based attempt number of this invocation within the node.
    pub attempt: u32,
    resume: Option<Signal>,
    signals: Vec<Signal>,
    gate: Arc<dyn CallGate>,
    events: Arc<dyn EventEmitter>,
    cancel: CancellationFlag,
}

impl StepContext {
    pub fn new(
        run_id: impl Into<RunId>,
        node: impl Into<NodeId>,
        gate: Arc<dyn CallGate>,
        events: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node: node.into(),
            attempt: 1,
            resume: None,
            signals: Vec::new(),
            gate,
            events,
            cancel: CancellationFlag::new(),
        }
    }

    /// Context with no call bound and no event sink.
    pub fn detached(run_id: impl Into<RunId>, node: impl Into<NodeId>) -> Self {
        Self::new(
            run_id,
            node,
            Arc::new(UnboundedCallGate),
            Arc::new(NoopEventEmitter),
        )
    }

    pub fn with_resume(mut self, resume: Option<Signal>) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    /// Resume data injected by `send_event` when this node was the interrupted one.
    pub fn resume_value(&self) -> Option<&Value> {
        self.resume.as_ref().map(|s| &s.data)
    }

    pub fn resume_signal(&self) -> Option<&Signal> {
        self.resume.as_ref()
    }

    /// Out-of-band signals delivered since the previous node.
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Convenience for `StepOutcome::Interrupt`.
    pub fn interrupt(&self, payload: Value) -> StepOutcome {
        interrupt(payload)
    }

    pub fn emit(&self, kind: EventKind, name: impl Into<String>, data: Value) {
        let draft = EventDraft::new(kind, name, data);
        if let Err(e) = self.events.emit(&self.run_id, draft) {
            tracing::warn!(run_id = %self.run_id, node = %self.node, error = %e, "failed to emit step event");
        }
    }

    pub fn emit_stream_chunk(&self, chunk: impl Into<String>) {
        self.emit(
            EventKind::StreamChunk,
            self.node.clone(),
            json!({ "chunk": chunk.into() }),
        );
    }

    /// Records token and cost usage of one model call.
    pub fn record_model_usage(
        &self,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_usd: f64,
    ) {
        self.emit(
            EventKind::ModelUsage,
            self.node.clone(),
            json!({
                "model": model,
                "usage": {
                    "prompt_tokens": prompt_tokens,
                    "completion_tokens": completion_tokens,
                    "cost_usd": cost_usd,
                }
            }),
        );
    }

    /// Runs one external call under the per-run call bound.
    pub async fn external_call<F, T>(&self, call: F) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, StepError>> + Send,
        T: Send,
    {
        let _permit = self
            .gate
            .acquire(&self.run_id)
            .await
            .map_err(|e| StepError::new("CallGate", e.to_string()))?;
        call.await
    }

    /// Runs one sub-task per item concurrently, each under the per-run call bound.
    /// Results come back in item order.
    pub async fn fan_out<I, T, F, Fut>(&self, items: Vec<I>, task: F) -> Vec<Result<T, StepError>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let total = items.len();
        let task = Arc::new(task);
        let mut set = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let gate = Arc::clone(&self.gate);
            let run_id = self.run_id.clone();
            let cancel = self.cancel.clone();
            let task = Arc::clone(&task);
            set.spawn(async move {
                if cancel.is_cancelled() {
                    return (idx, Err(StepError::cancelled()));
                }
                let permit = match gate.acquire(&run_id).await {
                    Ok(permit) => permit,
                    Err(e) => return (idx, Err(StepError::new("CallGate", e.to_string()))),
                };
                let result = task(item).await;
                drop(permit);
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<T, StepError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, node = %self.node, error = %e, "fan-out sub-task aborted");
                }
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(StepError::new("SubTaskAborted", "sub-task panicked"))))
            .collect()
    }
}

/// A pluggable step capability.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &StepContext, state: &Value) -> Result<StepOutcome, StepError>;
}

/// Degraded-result producer invoked when a step cannot succeed.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn recover(
        &self,
        ctx: &StepContext,
        state: &Value,
        error: &StepError,
    ) -> Result<StepOutcome, StepError>;
}

/// Fallback that keeps the state and flags it for human review.
pub struct FlagForReview;

#[async_trait]
impl Fallback for FlagForReview {
    async fn recover(
        &self,
        ctx: &StepContext,
        _state: &Value,
        error: &StepError,
    ) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::Update(json!({
            "needs_review": true,
            "review_reason": format!("{} failed: {}", ctx.node, error),
        })))
    }
}

/// Step built from an async closure over owned context and state.
pub struct FnStep<F> {
    f: F,
}

/// Wraps an async closure as a [Step].
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send,
{
    FnStep { f }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send,
{
    async fn run(&self, ctx: &StepContext, state: &Value) -> Result<StepOutcome, StepError> {
        (self.f)(ctx.clone(), state.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingGate {
        limit: usize,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct InFlight(Arc<AtomicUsize>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CallGate for CountingGate {
        async fn acquire(&self, _run_id: &RunId) -> Result<CallPermit, KernelError> {
            loop {
                let current = self.in_flight.load(Ordering::SeqCst);
                if current < self.limit
                    && self
                        .in_flight
                        .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    self.peak.fetch_max(current + 1, Ordering::SeqCst);
                    return Ok(CallPermit::new(InFlight(Arc::clone(&self.in_flight))));
                }
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn fan_out_preserves_order_and_respects_gate() {
        let peak = Arc::new(AtomicUsize::new(0));
        let gate = CountingGate {
            limit: 2,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let ctx = StepContext::new("run-fan", "grade", Arc::new(gate), Arc::new(NoopEventEmitter));
        let results = ctx
            .fan_out((1..=6).collect::<Vec<u32>>(), |n| async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                if n == 4 {
                    Err(StepError::new("ValidationError", "page 4 unreadable"))
                } else {
                    Ok(n * 10)
                }
            })
            .await;
        assert_eq!(results.len(), 6);
        assert_eq!(results[0], Ok(10));
        assert_eq!(results[5], Ok(60));
        assert!(results[3].is_err());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fn_step_sees_resume_value() {
        let step = step_fn(|ctx: StepContext, _state: Value| async move {
            match ctx.resume_value() {
                Some(v) => Ok(StepOutcome::Update(json!({ "approved": v.clone() }))),
                None => Ok(ctx.interrupt(json!({ "question": "approve?" }))),
            }
        });
        let ctx = StepContext::detached("run-1", "review");
        let first = step.run(&ctx, &json!({})).await.unwrap();
        assert!(matches!(first, StepOutcome::Interrupt(_)));

        let resumed = ctx.with_resume(Some(Signal::new("approve", json!(true))));
        let second = step.run(&resumed, &json!({})).await.unwrap();
        assert_eq!(second, StepOutcome::Update(json!({ "approved": true })));
    }

    #[test]
    fn step_error_class_uses_type_and_message() {
        assert_eq!(
            StepError::new("RateLimitError", "slow down").class(),
            FailureClass::Retryable
        );
        assert_eq!(
            StepError::new("Error", "permission denied for bucket").class(),
            FailureClass::NonRetryable
        );
        assert_eq!(StepError::cancelled().class(), FailureClass::UserCancelled);
    }
}
