//! Run observability store: per-run sequenced event ring buffer and derived metrics.
//!
//! Events are kept in a fixed-capacity ring buffer per run (oldest dropped first). Readers
//! resume with the `seq` cursor, so a disconnected client picks up exactly where it left off
//! for retained history. Metric counters are accumulated on ingest and therefore also cover
//! events that have since been evicted from the buffer.
//!
//! Traces of finished runs are kept for the most recent `retained_finished` runs only; an
//! evicted run is rebuilt from the durable log on demand through [RunObservabilityStore::backfill].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use conductor_kernel::{EventKind, KernelError, RunEvent, RunId, RunState, Seq};

use crate::config::BudgetConfig;
use crate::models::EventPage;

const LIVE_FEED_CAPACITY: usize = 1024;
const DEFAULT_RETAINED_FINISHED: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelUsage {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

/// Quality signals derived purely from the event stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QualitySignals {
    pub step_started: u64,
    pub step_retry: u64,
    pub step_failed: u64,
    pub node_completed: u64,
    pub review_triggered: u64,
    pub retry_rate: f64,
    pub failure_rate: f64,
    pub review_trigger_rate: f64,
}

/// Soft budget status. Budgets are reported, never enforced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BudgetReport {
    pub cost_budget_usd: Option<f64>,
    pub cost_exceeded: bool,
    pub time_budget_secs: Option<u64>,
    pub elapsed_secs: f64,
    pub time_exceeded: bool,
}

impl BudgetReport {
    pub fn exceeded(&self) -> bool {
        self.cost_exceeded || self.time_exceeded
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunMetrics {
    pub run_id: RunId,
    pub graph_name: String,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub event_count: u64,
    pub retained_events: usize,
    pub stream_chunks: u64,
    pub usage: UsageTotals,
    pub quality: QualitySignals,
    pub budget: BudgetReport,
}

#[derive(Default)]
struct Counters {
    event_count: u64,
    stream_chunks: u64,
    step_started: u64,
    step_retry: u64,
    step_failed: u64,
    node_completed: u64,
    review_triggered: u64,
    usage: UsageTotals,
}

impl Counters {
    fn ingest(&mut self, event: &RunEvent) {
        self.event_count += 1;
        match event.kind {
            EventKind::StreamChunk => self.stream_chunks += 1,
            EventKind::StepStarted => self.step_started += 1,
            EventKind::StepRetry => self.step_retry += 1,
            EventKind::StepFailed => self.step_failed += 1,
            EventKind::NodeCompleted => self.node_completed += 1,
            EventKind::ReviewTriggered => self.review_triggered += 1,
            _ => {}
        }
        self.ingest_usage(&event.data);
    }

    /// Any event tagged with `data.model` and `data.usage` contributes usage.
    fn ingest_usage(&mut self, data: &Value) {
        let (Some(model), Some(usage)) = (
            data.get("model").and_then(Value::as_str),
            data.get("usage").filter(|u| u.is_object()),
        ) else {
            return;
        };
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cost = usage.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);

        self.usage.prompt_tokens += prompt;
        self.usage.completion_tokens += completion;
        self.usage.total_tokens += prompt + completion;
        self.usage.cost_usd += cost;
        let entry = self.usage.by_model.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.prompt_tokens += prompt;
        entry.completion_tokens += completion;
        entry.cost_usd += cost;
    }

    fn quality(&self) -> QualitySignals {
        QualitySignals {
            step_started: self.step_started,
            step_retry: self.step_retry,
            step_failed: self.step_failed,
            node_completed: self.node_completed,
            review_triggered: self.review_triggered,
            retry_rate: ratio(self.step_retry, self.step_started),
            failure_rate: ratio(self.step_failed, self.step_started),
            review_trigger_rate: ratio(self.review_triggered, self.node_completed),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

struct RunTrace {
    graph_name: String,
    state: RunState,
    started_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
    last_seq: Seq,
    events: VecDeque<RunEvent>,
    counters: Counters,
    budget_warned: bool,
}

impl RunTrace {
    fn new(graph_name: String, capacity: usize) -> Self {
        Self {
            graph_name,
            state: RunState::Created,
            started_at: Utc::now(),
            last_event_at: None,
            last_seq: 0,
            events: VecDeque::with_capacity(capacity.min(64)),
            counters: Counters::default(),
            budget_warned: false,
        }
    }

    /// Appends `event` to the ring and counters; false for an already-seen seq.
    fn ingest(&mut self, event: &RunEvent, capacity: usize) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        self.last_seq = event.seq;
        self.last_event_at = Some(event.timestamp);
        self.counters.ingest(event);
        if self.events.len() >= capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        true
    }
}

/// Event kinds after which a run emits nothing more.
fn ends_run(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::RunCompleted | EventKind::RunFailed | EventKind::RunCancelled
    )
}

#[derive(Default)]
struct Traces {
    runs: HashMap<RunId, RunTrace>,
    /// Finished runs, oldest first.
    finished: VecDeque<RunId>,
}

impl Traces {
    fn mark_finished(&mut self, run_id: &RunId, retained: usize) {
        if !self.finished.contains(run_id) {
            self.finished.push_back(run_id.clone());
        }
        while self.finished.len() > retained {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.runs.remove(&oldest).is_some() {
                tracing::debug!(run_id = %oldest, "finished run trace evicted");
            }
        }
    }
}

pub struct RunObservabilityStore {
    capacity: usize,
    retained_finished: usize,
    traces: RwLock<Traces>,
    live: broadcast::Sender<RunEvent>,
}

impl RunObservabilityStore {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        Self {
            capacity: capacity.max(1),
            retained_finished: DEFAULT_RETAINED_FINISHED,
            traces: RwLock::new(Traces::default()),
            live,
        }
    }

    /// Caps how many finished runs keep their trace in memory.
    pub fn with_finished_retention(mut self, retained: usize) -> Self {
        self.retained_finished = retained.max(1);
        self
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Traces>, KernelError> {
        self.traces
            .write()
            .map_err(|e| KernelError::EventStore(e.to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Traces>, KernelError> {
        self.traces
            .read()
            .map_err(|e| KernelError::EventStore(e.to_string()))
    }

    /// Starts tracking a run. `last_seq` is the durable head when a run is re-registered
    /// after a restart.
    pub fn register_run(
        &self,
        run_id: &RunId,
        graph_name: &str,
        last_seq: Seq,
    ) -> Result<(), KernelError> {
        let mut guard = self.write()?;
        let trace = guard
            .runs
            .entry(run_id.clone())
            .or_insert_with(|| RunTrace::new(graph_name.to_string(), self.capacity));
        trace.last_seq = trace.last_seq.max(last_seq);
        Ok(())
    }

    pub fn update_state(&self, run_id: &RunId, state: RunState) -> Result<(), KernelError> {
        let mut guard = self.write()?;
        if let Some(trace) = guard.runs.get_mut(run_id) {
            trace.state = state;
        }
        Ok(())
    }

    /// Ingests a sequenced event. Events at or below the run's last seq are ignored.
    pub fn push_event(&self, event: &RunEvent) -> Result<bool, KernelError> {
        {
            let mut guard = self.write()?;
            let trace = guard
                .runs
                .entry(event.run_id.clone())
                .or_insert_with(|| RunTrace::new(String::new(), self.capacity));
            if !trace.ingest(event, self.capacity) {
                return Ok(false);
            }
            if ends_run(event.kind) {
                guard.mark_finished(&event.run_id, self.retained_finished);
            }
        }
        let _ = self.live.send(event.clone());
        Ok(true)
    }

    pub fn is_tracked(&self, run_id: &RunId) -> Result<bool, KernelError> {
        Ok(self.read()?.runs.contains_key(run_id))
    }

    /// Rebuilds the trace of a run from its durable log. No-op when the run is already
    /// tracked. Replayed events are not sent to live subscribers.
    pub fn backfill(
        &self,
        run_id: &RunId,
        graph_name: &str,
        state: RunState,
        events: &[RunEvent],
    ) -> Result<bool, KernelError> {
        let mut guard = self.write()?;
        if guard.runs.contains_key(run_id) {
            return Ok(false);
        }
        let mut trace = RunTrace::new(graph_name.to_string(), self.capacity);
        trace.state = state;
        if let Some(first) = events.first() {
            trace.started_at = first.timestamp;
        }
        let mut finished = false;
        for event in events {
            trace.ingest(event, self.capacity);
            finished |= ends_run(event.kind);
        }
        guard.runs.insert(run_id.clone(), trace);
        if finished {
            guard.mark_finished(run_id, self.retained_finished);
        }
        Ok(true)
    }

    /// Events with `seq > after_seq`, strictly increasing, at most `limit`.
    /// `None` when the run is not tracked.
    pub fn list_events(
        &self,
        run_id: &RunId,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Option<EventPage>, KernelError> {
        let guard = self.read()?;
        let Some(trace) = guard.runs.get(run_id) else {
            return Ok(None);
        };
        let events: Vec<RunEvent> = trace
            .events
            .iter()
            .filter(|e| e.seq > after_seq)
            .take(limit)
            .cloned()
            .collect();
        let next_seq = events.last().map(|e| e.seq).unwrap_or(after_seq);
        Ok(Some(EventPage { events, next_seq }))
    }

    /// Oldest retained seq, if any.
    pub fn oldest_retained(&self, run_id: &RunId) -> Result<Option<Seq>, KernelError> {
        Ok(self
            .read()?
            .runs
            .get(run_id)
            .and_then(|t| t.events.front().map(|e| e.seq)))
    }

    pub fn build_metrics(
        &self,
        run_id: &RunId,
        budget: &BudgetConfig,
    ) -> Result<Option<RunMetrics>, KernelError> {
        let mut guard = self.write()?;
        let Some(trace) = guard.runs.get_mut(run_id) else {
            return Ok(None);
        };
        let end = if trace.state.is_terminal() {
            trace.last_event_at.unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        };
        let elapsed_secs = (end - trace.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let cost = trace.counters.usage.cost_usd;
        let report = BudgetReport {
            cost_budget_usd: budget.cost_usd,
            cost_exceeded: budget.cost_usd.is_some_and(|limit| cost > limit),
            time_budget_secs: budget.wall_clock.map(|d| d.as_secs()),
            elapsed_secs,
            time_exceeded: budget
                .wall_clock
                .is_some_and(|limit| elapsed_secs > limit.as_secs_f64()),
        };
        if report.exceeded() && !trace.budget_warned {
            trace.budget_warned = true;
            tracing::warn!(
                run_id = %run_id,
                cost_usd = cost,
                elapsed_secs,
                cost_exceeded = report.cost_exceeded,
                time_exceeded = report.time_exceeded,
                "run exceeded soft budget"
            );
        }
        Ok(Some(RunMetrics {
            run_id: run_id.clone(),
            graph_name: trace.graph_name.clone(),
            state: trace.state.as_str().to_string(),
            started_at: trace.started_at,
            last_event_at: trace.last_event_at,
            event_count: trace.counters.event_count,
            retained_events: trace.events.len(),
            stream_chunks: trace.counters.stream_chunks,
            usage: trace.counters.usage.clone(),
            quality: trace.counters.quality(),
            budget: report,
        }))
    }

    /// Live feed of every ingested event across runs.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.live.subscribe()
    }
}
