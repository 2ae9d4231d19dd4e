//! Graph executor: drives one run from its latest checkpoint until it reaches an exit,
//! pauses at an interrupt, is cancelled, or fails.
//!
//! After every node the state is slimmed, its artifact set is stored under the next sequence
//! and a new checkpoint is written before the run moves on. Each (re)start of execution is a new Attempt. A run has
//! exactly one driver at a time; the [DriverSet] enforces that within the process.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use conductor_kernel::{
    rehydrate, slim_for_checkpoint, ArtifactStore, CallGate, CancellationFlag, CheckpointSnapshot,
    CheckpointStore, EventDraft, EventEmitter, EventKind, FailureRecord, InterruptKind,
    KernelError, PendingInterrupt, RetryExecutor, RetryObserver, RunEvent, RunId, RunState, Seq,
    Signal, SlimConfig, StepContext, StepError, StepOutcome, TransitionOutcome,
};

use crate::concurrency::{ConcurrencyController, QueueTicket};
use crate::graph::{CompiledGraph, Route};
use crate::models::{AttemptRecord, AttemptState};
use crate::observability::RunObservabilityStore;
use crate::repository::RunRepository;

const CLAIM_POLL: Duration = Duration::from_millis(10);
const EVENT_LOCK_STRIPES: usize = 64;

/// Stores the executor writes to.
#[derive(Clone)]
pub struct ExecutorStores {
    pub runs: Arc<dyn RunRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub observability: Arc<RunObservabilityStore>,
}

/// Sequences events in the durable log, then feeds the observability ring buffer.
///
/// Appending and ingesting happen under one per-run lock, so concurrent emitters of a run
/// (fan-out branches, signals, cancellation) reach the ring in seq order.
pub struct RunEventSink {
    runs: Arc<dyn RunRepository>,
    observability: Arc<RunObservabilityStore>,
    stripes: Vec<Mutex<()>>,
}

impl RunEventSink {
    pub fn new(runs: Arc<dyn RunRepository>, observability: Arc<RunObservabilityStore>) -> Self {
        Self {
            runs,
            observability,
            stripes: (0..EVENT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn order(&self, run_id: &RunId) -> Result<MutexGuard<'_, ()>, KernelError> {
        let mut hasher = DefaultHasher::new();
        run_id.hash(&mut hasher);
        let stripe = &self.stripes[hasher.finish() as usize % self.stripes.len()];
        stripe
            .lock()
            .map_err(|e| KernelError::EventStore(format!("event order lock poisoned: {e}")))
    }

    pub fn record(&self, run_id: &RunId, draft: EventDraft) -> Result<RunEvent, KernelError> {
        let _order = self.order(run_id)?;
        let event = self.runs.append_event(run_id, draft)?;
        if let Err(e) = self.observability.push_event(&event) {
            tracing::warn!(run_id = %run_id, seq = event.seq, error = %e, "observability ingest failed");
        }
        Ok(event)
    }

    /// Makes sure the observability store tracks the run, replaying its durable log when this
    /// process has not seen it yet (restart, eviction, or a run driven elsewhere).
    pub fn track(&self, run_id: &RunId, graph_name: &str, state: RunState) -> Result<(), KernelError> {
        let _order = self.order(run_id)?;
        if self.observability.is_tracked(run_id)? {
            return Ok(());
        }
        let events = self.runs.list_events(run_id, 0, usize::MAX)?;
        self.observability
            .backfill(run_id, graph_name, state, &events)?;
        Ok(())
    }
}

impl EventEmitter for RunEventSink {
    fn emit(&self, run_id: &RunId, draft: EventDraft) -> Result<Seq, KernelError> {
        self.record(run_id, draft).map(|event| event.seq)
    }
}

/// Runs currently being driven in this process, with their cancellation flags.
#[derive(Clone, Default)]
pub struct DriverSet {
    inner: Arc<Mutex<HashMap<RunId, CancellationFlag>>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, CancellationFlag>>, KernelError> {
        self.inner
            .lock()
            .map_err(|e| KernelError::Driver(format!("driver set lock poisoned: {e}")))
    }

    /// Claims `run_id` for a single driver; `None` when another driver already holds it.
    pub fn try_claim(&self, run_id: &RunId) -> Result<Option<DriverClaim>, KernelError> {
        let mut guard = self.guard()?;
        if guard.contains_key(run_id) {
            return Ok(None);
        }
        let cancel = CancellationFlag::new();
        guard.insert(run_id.clone(), cancel.clone());
        Ok(Some(DriverClaim {
            drivers: self.clone(),
            run_id: run_id.clone(),
            cancel,
        }))
    }

    /// Polls until the current driver (if any) lets go, up to `timeout`.
    pub async fn claim_when_released(
        &self,
        run_id: &RunId,
        timeout: Duration,
    ) -> Result<Option<DriverClaim>, KernelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(claim) = self.try_claim(run_id)? {
                return Ok(Some(claim));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    pub fn is_driving(&self, run_id: &RunId) -> bool {
        self.guard().map(|g| g.contains_key(run_id)).unwrap_or(false)
    }

    /// Sets the cancellation flag of the active driver; false when nobody drives the run.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.guard() {
            Ok(guard) => guard.get(run_id).map(|flag| flag.cancel()).is_some(),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "cannot signal cancellation");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.guard().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to drive one run. Released on drop.
pub struct DriverClaim {
    drivers: DriverSet,
    run_id: RunId,
    cancel: CancellationFlag,
}

impl DriverClaim {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }
}

impl Drop for DriverClaim {
    fn drop(&mut self) {
        match self.drivers.inner.lock() {
            Ok(mut guard) => {
                guard.remove(&self.run_id);
            }
            Err(e) => tracing::warn!(run_id = %self.run_id, error = %e, "driver claim not released"),
        }
    }
}

/// How one drive of a run ended.
#[derive(Clone, Debug, PartialEq)]
enum Ending {
    Completed { partial: bool },
    Paused,
    Cancelled,
    Failed(String),
}

pub struct GraphExecutor {
    stores: ExecutorStores,
    events: Arc<RunEventSink>,
    gate: Arc<dyn CallGate>,
    slim: SlimConfig,
    retry: RetryExecutor,
    drivers: DriverSet,
    inbox: Mutex<HashMap<RunId, Vec<Signal>>>,
}

impl GraphExecutor {
    pub fn new(
        stores: ExecutorStores,
        concurrency: &Arc<ConcurrencyController>,
        slim: SlimConfig,
    ) -> Arc<Self> {
        let events = Arc::new(RunEventSink::new(
            Arc::clone(&stores.runs),
            Arc::clone(&stores.observability),
        ));
        Arc::new(Self {
            stores,
            events,
            gate: concurrency.call_gate(),
            slim,
            retry: RetryExecutor::new(),
            drivers: DriverSet::new(),
            inbox: Mutex::new(HashMap::new()),
        })
    }

    pub fn drivers(&self) -> &DriverSet {
        &self.drivers
    }

    pub fn events(&self) -> &Arc<RunEventSink> {
        &self.events
    }

    /// Appends an event; failures are logged, never propagated.
    pub fn record(&self, run_id: &RunId, kind: EventKind, name: &str, data: Value) {
        if let Err(e) = self.events.record(run_id, EventDraft::new(kind, name, data)) {
            tracing::warn!(run_id = %run_id, kind = %kind, error = %e, "failed to record run event");
        }
    }

    /// Repository transition mirrored into the observability store and the event stream.
    pub fn transition(
        &self,
        run_id: &RunId,
        next: RunState,
    ) -> Result<TransitionOutcome, KernelError> {
        let outcome = self.stores.runs.transition(run_id, next)?;
        if outcome.changed() {
            self.stores.observability.update_state(run_id, outcome.current)?;
            self.record(
                run_id,
                EventKind::StateChanged,
                outcome.current.as_str(),
                json!({ "from": outcome.previous, "to": outcome.current }),
            );
        } else if !outcome.valid {
            tracing::debug!(run_id = %run_id, from = %outcome.previous, to = %next, "transition rejected");
        }
        Ok(outcome)
    }

    /// Queues an out-of-band signal for the next node of a running run.
    pub fn deliver_signal(&self, run_id: &RunId, signal: Signal) -> Result<(), KernelError> {
        self.inbox
            .lock()
            .map_err(|e| KernelError::Driver(format!("signal inbox lock poisoned: {e}")))?
            .entry(run_id.clone())
            .or_default()
            .push(signal);
        Ok(())
    }

    fn take_signals(&self, run_id: &RunId) -> Vec<Signal> {
        match self.inbox.lock() {
            Ok(mut inbox) => inbox.remove(run_id).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "signal inbox unavailable");
                Vec::new()
            }
        }
    }

    /// Drives the run on a tokio task. The claim is held until the task ends.
    pub fn spawn(
        self: &Arc<Self>,
        graph: Arc<CompiledGraph>,
        ticket: QueueTicket,
        claim: DriverClaim,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let run_id = claim.run_id().clone();
            if let Err(e) = executor.drive(&graph, ticket, &claim).await {
                tracing::error!(run_id = %run_id, error = %e, "run driver failed");
                executor.fail_run(&run_id, None, &format!("internal error: {e}"));
            }
            drop(claim);
        })
    }

    async fn drive(
        &self,
        graph: &CompiledGraph,
        ticket: QueueTicket,
        claim: &DriverClaim,
    ) -> Result<(), KernelError> {
        let run_id = claim.run_id().clone();
        let cancel = claim.cancellation().clone();
        let Some(slot) = ticket.activate(&cancel).await? else {
            tracing::info!(run_id = %run_id, "run cancelled while queued");
            return self.finish(&run_id, None, Ending::Cancelled);
        };

        let record = self
            .stores
            .runs
            .get_run(&run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.clone()))?;
        if record.state.is_terminal() {
            tracing::debug!(run_id = %run_id, state = %record.state, "run already terminal");
            return Ok(());
        }
        self.events
            .track(&run_id, &record.graph_name, record.state)?;
        self.stores.observability.update_state(&run_id, record.state)?;

        let snapshot = match self.stores.checkpoints.load_latest(&run_id)? {
            Some(snapshot) => snapshot,
            None => {
                let mut initial =
                    CheckpointSnapshot::initial(run_id.clone(), graph.entry().clone(), Value::Null);
                self.save_checkpoint(&mut initial, &record.input)?;
                initial
            }
        };
        if snapshot.is_paused() {
            tracing::debug!(run_id = %run_id, "run is paused, nothing to drive");
            return Ok(());
        }
        let state = self.load_state(&snapshot)?;

        let attempt = self.stores.runs.create_attempt(&run_id)?;
        let started = self.transition(&run_id, RunState::Running)?;
        if started.previous == RunState::Created {
            self.record(
                &run_id,
                EventKind::RunStarted,
                graph.name(),
                json!({ "attempt": attempt.attempt_number }),
            );
        }
        tracing::info!(
            run_id = %run_id,
            attempt = attempt.attempt_number,
            next_node = ?snapshot.next_node,
            "attempt started"
        );

        let ending = match self.run_nodes(graph, snapshot, state, &cancel).await {
            Ok(ending) => ending,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "node loop aborted");
                Ending::Failed(format!("internal error: {e}"))
            }
        };
        // The slot outlives the final state write so another worker never sees a live,
        // unreserved run.
        let finished = self.finish(&run_id, Some(&attempt), ending);
        drop(slot);
        finished
    }

    async fn run_nodes(
        &self,
        graph: &CompiledGraph,
        mut snapshot: CheckpointSnapshot,
        mut state: Value,
        cancel: &CancellationFlag,
    ) -> Result<Ending, KernelError> {
        let run_id = snapshot.run_id.clone();
        let observer = NodeObserver {
            executor: self,
            run_id: &run_id,
        };
        loop {
            let Some(node) = snapshot.next_node.clone() else {
                return Ok(Ending::Completed {
                    partial: snapshot.partial,
                });
            };
            if self.cancel_observed(&run_id, cancel)? {
                return Ok(Ending::Cancelled);
            }

            let resume = snapshot.resume.take();
            if resume.is_none() && graph.interrupts_before(&node) {
                let pending = PendingInterrupt::new(
                    node.clone(),
                    InterruptKind::Breakpoint,
                    json!({ "reason": "interrupt_before", "node": node }),
                );
                return self.pause(snapshot, &state, pending);
            }
            let Some(step) = graph.step(&node) else {
                return Ok(Ending::Failed(format!(
                    "node {node} is not part of graph {}",
                    graph.name()
                )));
            };

            let mut signals = std::mem::take(&mut snapshot.signals);
            signals.extend(self.take_signals(&run_id));
            self.record(
                &run_id,
                EventKind::NodeStarted,
                &node,
                json!({ "step": step.name, "resumed": resume.is_some() }),
            );
            let events: Arc<dyn EventEmitter> = self.events.clone();
            let ctx = StepContext::new(run_id.clone(), node.clone(), Arc::clone(&self.gate), events)
                .with_resume(resume)
                .with_signals(signals)
                .with_cancellation(cancel.clone());

            let result = self.retry.execute(step, &ctx, &state, &observer).await;
            if self.cancel_observed(&run_id, cancel)? {
                tracing::info!(run_id = %run_id, node = %node, "run cancelled during node, result discarded");
                return Ok(Ending::Cancelled);
            }
            let run = match result {
                Ok(run) => run,
                Err(failure) if failure.is_cancelled() => return Ok(Ending::Cancelled),
                Err(failure) => return Ok(Ending::Failed(failure.to_string())),
            };

            let patch = match run.outcome {
                StepOutcome::Interrupt(payload) => {
                    let pending = PendingInterrupt::new(node.clone(), InterruptKind::Dynamic, payload);
                    return self.pause(snapshot, &state, pending);
                }
                StepOutcome::Update(patch) => patch,
                StepOutcome::Partial { update, failures } => {
                    self.record_partial(&run_id, &node, &failures);
                    snapshot.partial = true;
                    self.transition(&run_id, RunState::PartialFailed)?;
                    update
                }
            };
            let flags_review = patch.get("needs_review") == Some(&Value::Bool(true));
            if let Err(reason) = merge_patch(&mut state, patch) {
                return Ok(Ending::Failed(format!("{node}: {reason}")));
            }
            if run.degraded || flags_review {
                self.record(
                    &run_id,
                    EventKind::ReviewTriggered,
                    &node,
                    json!({
                        "degraded": run.degraded,
                        "reason": state.get("review_reason").cloned().unwrap_or(Value::Null),
                    }),
                );
            }
            self.record(
                &run_id,
                EventKind::NodeCompleted,
                &node,
                json!({ "attempts": run.attempts, "degraded": run.degraded }),
            );
            snapshot.completed_steps += 1;

            let route = graph.route(&node, &state);
            match &route {
                Ok(Route::Next(next)) => snapshot.next_node = Some(next.clone()),
                Ok(Route::Exit) => snapshot.next_node = None,
                // Keep the node's work; a chained retry re-enters at this node.
                Err(_) => {}
            }
            self.save_checkpoint(&mut snapshot, &state)?;
            if let Err(e) = route {
                return Ok(Ending::Failed(e.to_string()));
            }
        }
    }

    fn cancel_observed(&self, run_id: &RunId, cancel: &CancellationFlag) -> Result<bool, KernelError> {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        Ok(self
            .stores
            .runs
            .get_run(run_id)?
            .is_some_and(|r| r.state == RunState::Cancelled))
    }

    fn record_partial(&self, run_id: &RunId, node: &str, failures: &[String]) {
        for failure in failures {
            let record = FailureRecord::new(node, &StepError::new("PartialFailure", failure.clone()), 1);
            if let Err(e) = self.stores.runs.append_failure(run_id, &record) {
                tracing::warn!(run_id = %run_id, node, error = %e, "failed to record partial failure");
            }
        }
        tracing::warn!(run_id = %run_id, node, failed_items = failures.len(), "node produced a partial result");
    }

    fn pause(
        &self,
        mut snapshot: CheckpointSnapshot,
        state: &Value,
        pending: PendingInterrupt,
    ) -> Result<Ending, KernelError> {
        let run_id = snapshot.run_id.clone();
        let data = json!({
            "interrupt_id": pending.interrupt_id,
            "kind": pending.kind,
            "payload": pending.payload,
        });
        let node = pending.node.clone();
        snapshot.pending_interrupt = Some(pending);
        // Signals that arrived during the interrupting node wait in the checkpoint.
        snapshot.signals.extend(self.take_signals(&run_id));
        self.save_checkpoint(&mut snapshot, state)?;
        self.record(&run_id, EventKind::Interrupted, &node, data);
        tracing::info!(run_id = %run_id, node = %node, "run paused at interrupt");
        Ok(Ending::Paused)
    }

    /// Full state of a checkpoint: its slimmed state with the artifact set it references.
    pub(crate) fn load_state(&self, snapshot: &CheckpointSnapshot) -> Result<Value, KernelError> {
        let artifacts = self
            .stores
            .artifacts
            .list(&snapshot.run_id, snapshot.artifact_sequence)?;
        Ok(rehydrate(&snapshot.sanitized_state, &artifacts))
    }

    /// Slims `state` into `snapshot` and persists it under a new sequence.
    ///
    /// The artifact set is stored under the new sequence before the checkpoint that points at
    /// it; older sets are dropped only once the checkpoint committed.
    pub(crate) fn save_checkpoint(
        &self,
        snapshot: &mut CheckpointSnapshot,
        state: &Value,
    ) -> Result<(), KernelError> {
        let run_id = snapshot.run_id.clone();
        let slimmed = slim_for_checkpoint(&run_id, state, &self.slim);
        let mut next = snapshot.clone();
        next.sequence += 1;
        next.artifact_sequence = next.sequence;
        next.sanitized_state = slimmed.state;
        next.coarse = slimmed.coarse;
        next.created_at = Utc::now();
        self.stores
            .artifacts
            .put(&run_id, next.artifact_sequence, &slimmed.artifacts)?;
        self.stores.checkpoints.save(&next)?;
        *snapshot = next;
        if let Err(e) = self
            .stores
            .artifacts
            .retain_only(&run_id, snapshot.artifact_sequence)
        {
            tracing::warn!(run_id = %run_id, sequence = snapshot.sequence, error = %e, "stale artifact sets not pruned");
        }
        self.stores.runs.set_checkpoint_ref(&run_id, snapshot.sequence)?;
        self.record(
            &run_id,
            EventKind::CheckpointSaved,
            "checkpoint",
            json!({
                "sequence": snapshot.sequence,
                "artifacts": slimmed.artifacts.len(),
                "coarse": slimmed.coarse,
            }),
        );
        Ok(())
    }

    fn finish(
        &self,
        run_id: &RunId,
        attempt: Option<&AttemptRecord>,
        ending: Ending,
    ) -> Result<(), KernelError> {
        if ending != Ending::Paused {
            // Nothing consumes signals of a run that stopped executing.
            let dropped = self.take_signals(run_id);
            if !dropped.is_empty() {
                tracing::debug!(run_id = %run_id, dropped = dropped.len(), "undelivered signals discarded");
            }
        }
        match ending {
            Ending::Completed { partial } => {
                let target = if partial {
                    RunState::PartialFailed
                } else {
                    RunState::Completed
                };
                let outcome = self.transition(run_id, target)?;
                if !outcome.valid {
                    if outcome.current == RunState::Cancelled {
                        tracing::info!(run_id = %run_id, "run cancelled after its last node, result discarded");
                        return self.finish(run_id, attempt, Ending::Cancelled);
                    }
                    tracing::warn!(run_id = %run_id, state = %outcome.current, "run not completed from its current state");
                    self.finish_attempt(attempt, AttemptState::Failed, Some(format!("cannot complete from {}", outcome.current)));
                    return Ok(());
                }
                self.finish_attempt(attempt, AttemptState::Completed, None);
                self.record(run_id, EventKind::RunCompleted, target.as_str(), json!({ "partial": partial }));
                tracing::info!(run_id = %run_id, state = %target, "run finished");
            }
            Ending::Paused => self.finish_attempt(attempt, AttemptState::Paused, None),
            Ending::Cancelled => {
                self.transition(run_id, RunState::Cancelled)?;
                self.finish_attempt(attempt, AttemptState::Cancelled, None);
                self.record(run_id, EventKind::RunCancelled, "cancelled", json!({}));
                tracing::info!(run_id = %run_id, "run cancelled");
            }
            Ending::Failed(message) => self.fail_run(run_id, attempt, &message),
        }
        Ok(())
    }

    fn fail_run(&self, run_id: &RunId, attempt: Option<&AttemptRecord>, message: &str) {
        match self.transition(run_id, RunState::Failed) {
            Ok(outcome) if outcome.valid => {
                if let Err(e) = self.stores.runs.set_error(run_id, Some(message.to_string())) {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to store run error");
                }
                self.record(run_id, EventKind::RunFailed, "failed", json!({ "error": message }));
            }
            Ok(_) => {}
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "failed to mark run failed"),
        }
        self.finish_attempt(attempt, AttemptState::Failed, Some(message.to_string()));
        tracing::warn!(run_id = %run_id, error = message, "run failed");
    }

    fn finish_attempt(&self, attempt: Option<&AttemptRecord>, state: AttemptState, error: Option<String>) {
        let Some(attempt) = attempt else {
            return;
        };
        if let Err(e) = self
            .stores
            .runs
            .finish_attempt(&attempt.attempt_id, state, error)
        {
            tracing::warn!(run_id = %attempt.run_id, attempt = attempt.attempt_number, error = %e, "failed to close attempt");
        }
    }
}

/// Shallow-merges an object patch into the run state. `null` is a no-op.
fn merge_patch(state: &mut Value, patch: Value) -> Result<(), String> {
    let patch = match patch {
        Value::Object(map) => map,
        Value::Null => return Ok(()),
        other => return Err(format!("step output must be a JSON object, got {other}")),
    };
    if !state.is_object() {
        *state = Value::Object(Default::default());
    }
    if let Some(target) = state.as_object_mut() {
        target.extend(patch);
    }
    Ok(())
}

/// Records failures on the run and drives RUNNING/RETRYING around backoff.
struct NodeObserver<'a> {
    executor: &'a GraphExecutor,
    run_id: &'a RunId,
}

impl NodeObserver<'_> {
    fn transition(&self, next: RunState) {
        if let Err(e) = self.executor.transition(self.run_id, next) {
            tracing::warn!(run_id = %self.run_id, to = %next, error = %e, "retry transition failed");
        }
    }
}

impl RetryObserver for NodeObserver<'_> {
    fn on_attempt(&self, node: &str, attempt: u32) {
        self.executor
            .record(self.run_id, EventKind::StepStarted, node, json!({ "attempt": attempt }));
    }

    fn on_failure(&self, record: &FailureRecord) {
        if let Err(e) = self.executor.stores.runs.append_failure(self.run_id, record) {
            tracing::warn!(run_id = %self.run_id, node = %record.node, error = %e, "failed to store failure record");
        }
        let data = serde_json::to_value(record).unwrap_or(Value::Null);
        self.executor
            .record(self.run_id, EventKind::StepFailed, &record.node, data);
    }

    fn on_retry_scheduled(&self, record: &FailureRecord, delay: Duration) {
        self.executor.record(
            self.run_id,
            EventKind::StepRetry,
            &record.node,
            json!({ "attempt": record.attempt, "delay_ms": delay.as_millis() as u64 }),
        );
        self.transition(RunState::Retrying);
    }

    fn on_retry_resumed(&self, _node: &str, _attempt: u32) {
        self.transition(RunState::Running);
    }

    fn on_fallback(&self, record: &FailureRecord) {
        self.executor.record(
            self.run_id,
            EventKind::FallbackApplied,
            &record.node,
            json!({ "after_attempt": record.attempt, "error": record.summary() }),
        );
    }
}
