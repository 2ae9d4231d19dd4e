//! Orchestrator facade: the external contract composing admission, execution, persistence
//! and observability.
//!
//! Every operation goes through the run repository first; nothing here keeps run state of
//! its own apart from the compiled graphs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use conductor_kernel::{
    Artifact, ArtifactStore, CheckpointSnapshot, CheckpointStore, EventKind,
    InMemoryArtifactStore, InMemoryCheckpointStore, KernelError, RunEvent, RunId, RunState, Signal,
    StepRegistry,
};

use crate::concurrency::{
    AdmissionError, ConcurrencyController, ConcurrencySnapshot, CountingStore,
    InMemoryCountingStore, RejectionReason,
};
use crate::config::{EngineConfig, StorageBackend};
use crate::executor::{ExecutorStores, GraphExecutor};
use crate::graph::{CompiledGraph, GraphBuilder, GraphError};
use crate::models::{AttemptRecord, EventPage, PausedRun, RunFilter, RunInfo, RunProgress, RunRecord, PAUSED};
use crate::observability::{RunMetrics, RunObservabilityStore};
use crate::repository::{InMemoryRunRepository, RunRepository};

/// Submitter used by [Orchestrator::start_run].
pub const DEFAULT_SUBMITTER: &str = "default";

/// Event type that cancels instead of resuming.
pub const CANCEL_EVENT: &str = "cancel";

const RESUME_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("unknown graph: {0}")]
    UnknownGraph(String),
    #[error("run already exists: {run_id}")]
    AlreadyExists { run_id: RunId },
    #[error("run {run_id} is {state}: {reason}")]
    InvalidState {
        run_id: RunId,
        state: RunState,
        reason: String,
    },
    #[error("admission rejected: {0}")]
    Rejected(RejectionReason),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl From<AdmissionError> for OrchestratorError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Rejected(reason) => OrchestratorError::Rejected(reason),
            AdmissionError::Store(e) => OrchestratorError::Kernel(e),
        }
    }
}

/// Outcome of one recovery sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pruned_reservations: usize,
    pub resumed: Vec<RunId>,
}

pub struct Orchestrator {
    config: EngineConfig,
    registry: StepRegistry,
    graphs: RwLock<HashMap<String, Arc<CompiledGraph>>>,
    stores: ExecutorStores,
    concurrency: Arc<ConcurrencyController>,
    executor: Arc<GraphExecutor>,
    admission: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// In-memory stores regardless of `config.storage_backend`.
    pub fn new(registry: StepRegistry, config: EngineConfig) -> Self {
        Self::with_stores(
            registry,
            config,
            Arc::new(InMemoryRunRepository::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(InMemoryCountingStore::new()),
        )
    }

    /// Workers that share `runs` and `counting` see each other's runs and reservations.
    pub fn with_stores(
        registry: StepRegistry,
        config: EngineConfig,
        runs: Arc<dyn RunRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        artifacts: Arc<dyn ArtifactStore>,
        counting: Arc<dyn CountingStore>,
    ) -> Self {
        let observability = RunObservabilityStore::new(config.event_buffer_capacity)
            .with_finished_retention(config.retained_finished_runs);
        let stores = ExecutorStores {
            runs,
            checkpoints,
            artifacts,
            observability: Arc::new(observability),
        };
        let concurrency = ConcurrencyController::new(counting, config.concurrency.clone());
        let executor = GraphExecutor::new(stores.clone(), &concurrency, config.checkpoint.clone());
        Self {
            config,
            registry,
            graphs: RwLock::new(HashMap::new()),
            stores,
            concurrency,
            executor,
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Stores chosen by `config.storage_backend`.
    pub fn from_config(registry: StepRegistry, config: EngineConfig) -> Result<Self, OrchestratorError> {
        match config.storage_backend {
            StorageBackend::Memory => Ok(Self::new(registry, config)),
            #[cfg(feature = "sqlite-persistence")]
            StorageBackend::Sqlite => {
                let runs = Arc::new(crate::sqlite_repository::SqliteRunRepository::new(
                    &config.sqlite_db_path,
                )?);
                let checkpoints = Arc::new(conductor_kernel::SqliteCheckpointStore::new(
                    config.sqlite_db_path.clone(),
                ));
                let artifacts: Arc<dyn ArtifactStore> = checkpoints.clone();
                let counting = Arc::new(crate::sqlite_counting::SqliteCountingStore::new(
                    &config.sqlite_db_path,
                )?);
                tracing::info!(db = %config.sqlite_db_path, "using sqlite persistence");
                Ok(Self::with_stores(
                    registry,
                    config,
                    runs,
                    checkpoints,
                    artifacts,
                    counting,
                ))
            }
            #[cfg(not(feature = "sqlite-persistence"))]
            StorageBackend::Sqlite => Err(OrchestratorError::Kernel(KernelError::Driver(
                "sqlite backend requires the sqlite-persistence feature".to_string(),
            ))),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Compiles `builder` against the step registry and makes it startable by name.
    pub fn register_graph(&self, builder: GraphBuilder) -> Result<(), OrchestratorError> {
        let graph = builder.compile(&self.registry)?;
        let name = graph.name().to_string();
        self.graphs
            .write()
            .map_err(|e| KernelError::Driver(e.to_string()))?
            .insert(name.clone(), Arc::new(graph));
        tracing::info!(graph = %name, "graph registered");
        Ok(())
    }

    fn graph(&self, name: &str) -> Result<Arc<CompiledGraph>, OrchestratorError> {
        self.graphs
            .read()
            .map_err(|e| KernelError::Driver(e.to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownGraph(name.to_string()))
    }

    fn load_run(&self, run_id: &RunId) -> Result<RunRecord, OrchestratorError> {
        self.stores
            .runs
            .get_run(run_id)?
            .ok_or_else(|| OrchestratorError::NotFound(run_id.clone()))
    }

    fn ensure_tracked(&self, record: &RunRecord) -> Result<(), OrchestratorError> {
        self.executor
            .events()
            .track(&record.run_id, &record.graph_name, record.state)?;
        Ok(())
    }

    pub async fn start_run(
        &self,
        graph_name: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<RunId, OrchestratorError> {
        self.start_run_as(DEFAULT_SUBMITTER, graph_name, payload, idempotency_key)
            .await
    }

    /// Starts a run on behalf of `submitter` (the unit of per-submitter fairness).
    pub async fn start_run_as(
        &self,
        submitter: &str,
        graph_name: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<RunId, OrchestratorError> {
        let graph = self.graph(graph_name)?;
        let _admission = self.admission.lock().await;
        let run_id = match idempotency_key {
            Some(key) => self.run_id_for_key(key)?,
            None => Uuid::new_v4().to_string(),
        };

        let claim = self
            .executor
            .drivers()
            .try_claim(&run_id)?
            .ok_or_else(|| OrchestratorError::AlreadyExists {
                run_id: run_id.clone(),
            })?;
        let ticket = self.concurrency.admit(&run_id, submitter)?;

        let mut record = RunRecord::new(run_id.clone(), graph.name(), submitter, normalize_input(payload));
        record.idempotency_key = idempotency_key.map(String::from);
        self.stores.runs.insert_run(&record)?;
        if let Some(key) = idempotency_key {
            self.stores.runs.bind_idempotency_key(key, &run_id)?;
        }
        self.stores
            .observability
            .register_run(&run_id, graph.name(), 0)?;
        self.executor.record(
            &run_id,
            EventKind::RunCreated,
            graph.name(),
            json!({ "submitter": submitter, "idempotency_key": idempotency_key }),
        );
        self.executor.spawn(graph, ticket, claim);
        tracing::info!(run_id = %run_id, graph = graph_name, submitter, "run started");
        Ok(run_id)
    }

    /// First use of a key makes it the run id; a key bound to a finished run is rebound to
    /// a fresh id.
    fn run_id_for_key(&self, key: &str) -> Result<RunId, OrchestratorError> {
        if let Some(existing) = self.stores.runs.lookup_idempotency_key(key)? {
            if let Some(run) = self.stores.runs.get_run(&existing)? {
                if !run.state.is_terminal() {
                    return Err(OrchestratorError::AlreadyExists { run_id: existing });
                }
                let short = Uuid::new_v4().simple().to_string();
                let rebound = format!("{key}-{}", &short[..8]);
                tracing::info!(key, previous = %existing, run_id = %rebound, "idempotency key rebound");
                return Ok(rebound);
            }
        }
        if self.stores.runs.get_run(&key.to_string())?.is_some() {
            return Ok(Uuid::new_v4().to_string());
        }
        Ok(key.to_string())
    }

    fn run_info(&self, record: RunRecord, checkpoint: Option<CheckpointSnapshot>) -> RunInfo {
        let paused = !record.state.is_terminal()
            && checkpoint.as_ref().is_some_and(|c| c.is_paused());
        let status = if paused {
            PAUSED.to_string()
        } else {
            record.state.as_str().to_string()
        };
        let (progress, pending_interrupt, state) = match checkpoint {
            Some(c) => (
                RunProgress {
                    completed_steps: c.completed_steps,
                    current_node: c.next_node,
                },
                c.pending_interrupt,
                c.sanitized_state,
            ),
            None => (
                RunProgress {
                    completed_steps: 0,
                    current_node: None,
                },
                None,
                record.input.clone(),
            ),
        };
        RunInfo {
            run_id: record.run_id,
            graph_name: record.graph_name,
            status,
            run_state: record.state.as_str().to_string(),
            legacy_status: record.state.legacy_status().to_string(),
            progress,
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
            error: record.error,
            pending_interrupt,
            retry_of: record.retry_of,
            state,
        }
    }

    pub fn get_status(&self, run_id: &str) -> Result<RunInfo, OrchestratorError> {
        let run_id = run_id.to_string();
        let record = self.load_run(&run_id)?;
        let checkpoint = self.stores.checkpoints.load_latest(&run_id)?;
        Ok(self.run_info(record, checkpoint))
    }

    /// Marks the run CANCELLED; a running node finishes but its result is discarded.
    pub fn cancel(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        let run_id = run_id.to_string();
        let record = self.load_run(&run_id)?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        self.ensure_tracked(&record)?;
        let outcome = self.executor.transition(&run_id, RunState::Cancelled)?;
        if !outcome.valid {
            return Ok(false);
        }
        if !self.executor.drivers().cancel(&run_id) {
            // Nobody drives the run (paused or orphaned); close it out here.
            self.executor
                .record(&run_id, EventKind::RunCancelled, "cancelled", json!({}));
        }
        tracing::info!(run_id = %run_id, "run cancel requested");
        Ok(true)
    }

    /// Chains a new run from the last checkpoint of a FAILED, CANCELLED or PARTIAL_FAILED run.
    pub async fn retry(&self, run_id: &str) -> Result<RunId, OrchestratorError> {
        let old_id = run_id.to_string();
        let old = self.load_run(&old_id)?;
        if !matches!(
            old.state,
            RunState::Failed | RunState::Cancelled | RunState::PartialFailed
        ) {
            return Err(OrchestratorError::InvalidState {
                run_id: old_id,
                state: old.state,
                reason: "only FAILED, CANCELLED or PARTIAL_FAILED runs can be retried".to_string(),
            });
        }
        if old.state == RunState::PartialFailed && self.executor.drivers().is_driving(&old_id) {
            return Err(OrchestratorError::InvalidState {
                run_id: old_id,
                state: old.state,
                reason: "run is still executing".to_string(),
            });
        }
        let graph = self.graph(&old.graph_name)?;
        let _admission = self.admission.lock().await;
        let new_id = Uuid::new_v4().to_string();
        let claim = self
            .executor
            .drivers()
            .try_claim(&new_id)?
            .ok_or_else(|| OrchestratorError::AlreadyExists {
                run_id: new_id.clone(),
            })?;
        let ticket = self.concurrency.admit(&new_id, &old.submitter)?;

        let mut record = RunRecord::new(new_id.clone(), graph.name(), old.submitter.clone(), old.input.clone());
        record.retry_of = Some(old_id.clone());
        self.stores.runs.insert_run(&record)?;
        self.stores
            .observability
            .register_run(&new_id, graph.name(), 0)?;

        self.executor.record(
            &new_id,
            EventKind::RunCreated,
            graph.name(),
            json!({ "submitter": old.submitter, "retry_of": old_id }),
        );

        // A run that reached an exit (partial result) starts over from the entry node.
        if let Some(checkpoint) = self.stores.checkpoints.load_latest(&old_id)? {
            if let Some(next_node) = checkpoint.next_node.clone() {
                let state = self.executor.load_state(&checkpoint)?;
                let mut snapshot = CheckpointSnapshot::initial(new_id.clone(), next_node, Value::Null);
                snapshot.completed_steps = checkpoint.completed_steps;
                self.executor.save_checkpoint(&mut snapshot, &state)?;
            }
        }
        self.executor.spawn(graph, ticket, claim);
        tracing::info!(run_id = %new_id, retry_of = %old_id, "run retried");
        Ok(new_id)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunInfo>, OrchestratorError> {
        self.stores
            .runs
            .list_runs(filter)?
            .into_iter()
            .map(|record| -> Result<RunInfo, OrchestratorError> {
                let checkpoint = self.stores.checkpoints.load_latest(&record.run_id)?;
                Ok(self.run_info(record, checkpoint))
            })
            .collect()
    }

    /// Resumes an interrupted run with `event_data`, or queues it as a signal for a running
    /// one. `cancel` cancels. False for unknown and terminal runs.
    pub async fn send_event(
        &self,
        run_id: &str,
        event_type: &str,
        event_data: Value,
    ) -> Result<bool, OrchestratorError> {
        let run_id = run_id.to_string();
        let Some(record) = self.stores.runs.get_run(&run_id)? else {
            return Ok(false);
        };
        if record.state.is_terminal() {
            return Ok(false);
        }
        self.ensure_tracked(&record)?;
        if event_type == CANCEL_EVENT {
            return self.cancel(&run_id);
        }
        let signal = Signal::new(event_type, event_data);
        let paused = self
            .stores
            .checkpoints
            .load_latest(&run_id)?
            .is_some_and(|c| c.is_paused());
        if paused {
            return self.resume(record, signal).await;
        }
        self.executor.record(
            &run_id,
            EventKind::Signal,
            event_type,
            json!({ "data": signal.data.clone() }),
        );
        self.executor.deliver_signal(&run_id, signal)?;
        Ok(true)
    }

    async fn resume(&self, record: RunRecord, signal: Signal) -> Result<bool, OrchestratorError> {
        let run_id = record.run_id.clone();
        let graph = self.graph(&record.graph_name)?;
        let Some(claim) = self
            .executor
            .drivers()
            .claim_when_released(&run_id, RESUME_CLAIM_TIMEOUT)
            .await?
        else {
            tracing::warn!(run_id = %run_id, "run still has an active driver, resume skipped");
            return Ok(false);
        };
        let Some(mut snapshot) = self.stores.checkpoints.load_latest(&run_id)? else {
            return Ok(false);
        };
        let Some(pending) = snapshot.pending_interrupt.clone() else {
            // Resumed by someone else in the meantime.
            self.executor.deliver_signal(&run_id, signal)?;
            return Ok(true);
        };
        let ticket = self.concurrency.admit(&run_id, &record.submitter)?;

        self.executor.record(
            &run_id,
            EventKind::Resumed,
            &pending.node,
            json!({ "interrupt_id": pending.interrupt_id, "event_type": signal.event_type }),
        );
        snapshot.pending_interrupt = None;
        snapshot.resume = Some(signal);
        snapshot.sequence += 1;
        snapshot.created_at = chrono::Utc::now();
        self.stores.checkpoints.save(&snapshot)?;
        self.stores.runs.set_checkpoint_ref(&run_id, snapshot.sequence)?;

        self.executor.spawn(graph, ticket, claim);
        tracing::info!(run_id = %run_id, node = %pending.node, "run resumed");
        Ok(true)
    }

    pub fn list_attempts(&self, run_id: &str) -> Result<Vec<AttemptRecord>, OrchestratorError> {
        let run_id = run_id.to_string();
        self.load_run(&run_id)?;
        Ok(self.stores.runs.list_attempts(&run_id)?)
    }

    /// Non-terminal runs whose latest checkpoint carries a pending interrupt.
    pub fn list_pending_interrupts(&self) -> Result<Vec<PausedRun>, OrchestratorError> {
        let mut paused = Vec::new();
        for checkpoint in self.stores.checkpoints.list_paused()? {
            let Some(record) = self.stores.runs.get_run(&checkpoint.run_id)? else {
                continue;
            };
            if record.state.is_terminal() {
                continue;
            }
            if let Some(interrupt) = checkpoint.pending_interrupt {
                paused.push(PausedRun {
                    run_id: record.run_id,
                    graph_name: record.graph_name,
                    interrupt,
                    paused_at: checkpoint.created_at,
                });
            }
        }
        Ok(paused)
    }

    /// True once the run is terminal, paused, or finished with a partial result, and no
    /// driver is active for it.
    fn is_settled(&self, info: &RunInfo) -> bool {
        let finished_partial = info.run_state == RunState::PartialFailed.as_str()
            && info.progress.current_node.is_none();
        (info.is_terminal() || info.is_paused() || finished_partial)
            && !self.executor.drivers().is_driving(&info.run_id)
    }

    /// Polls until the run settles or `timeout` elapses; returns the last observed status.
    pub async fn wait_until_settled(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<RunInfo, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info = self.get_status(run_id)?;
            if self.is_settled(&info) || tokio::time::Instant::now() >= deadline {
                return Ok(info);
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    /// Metrics from the observability store, rebuilt from the durable log when the run is
    /// not tracked in this process.
    pub fn get_run_metrics(&self, run_id: &str) -> Result<RunMetrics, OrchestratorError> {
        let run_id = run_id.to_string();
        let obs = &self.stores.observability;
        if let Some(metrics) = obs.build_metrics(&run_id, &self.config.budget)? {
            return Ok(metrics);
        }
        let record = self.load_run(&run_id)?;
        self.ensure_tracked(&record)?;
        obs.build_metrics(&run_id, &self.config.budget)?
            .ok_or(OrchestratorError::NotFound(run_id))
    }

    /// Events with `seq > after_seq`. Served from the ring buffer while it still covers the
    /// cursor, otherwise from the durable log.
    pub fn get_run_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<EventPage, OrchestratorError> {
        let run_id = run_id.to_string();
        let obs = &self.stores.observability;
        if let Some(oldest) = obs.oldest_retained(&run_id)? {
            if oldest <= after_seq.saturating_add(1) {
                if let Some(page) = obs.list_events(&run_id, after_seq, limit)? {
                    return Ok(page);
                }
            }
        }
        self.load_run(&run_id)?;
        let events = self.stores.runs.list_events(&run_id, after_seq, limit)?;
        let next_seq = events.last().map(|e| e.seq).unwrap_or(after_seq);
        Ok(EventPage { events, next_seq })
    }

    pub fn get_run_artifact(
        &self,
        run_id: &str,
        artifact_id: &str,
    ) -> Result<Option<Artifact>, OrchestratorError> {
        let run_id = run_id.to_string();
        self.load_run(&run_id)?;
        let Some(checkpoint) = self.stores.checkpoints.load_latest(&run_id)? else {
            return Ok(None);
        };
        Ok(self
            .stores
            .artifacts
            .get(&run_id, checkpoint.artifact_sequence, artifact_id)?)
    }

    pub fn concurrency_snapshot(&self) -> Result<ConcurrencySnapshot, OrchestratorError> {
        Ok(self.concurrency.snapshot()?)
    }

    /// Live feed of every run event ingested in this process.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.stores.observability.subscribe()
    }

    /// Prunes expired reservations and re-drives non-terminal runs that nobody drives and
    /// that are neither paused nor finished. A run whose active reservation is still live in
    /// the counting store is driven by another worker and left alone.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport {
            pruned_reservations: self.concurrency.prune_expired()?,
            resumed: Vec::new(),
        };
        for record in self.stores.runs.list_non_terminal()? {
            let run_id = record.run_id.clone();
            if self.executor.drivers().is_driving(&run_id) {
                continue;
            }
            if self.concurrency.is_active(&run_id)? {
                tracing::debug!(run_id = %run_id, "run holds a live reservation elsewhere");
                continue;
            }
            if let Some(checkpoint) = self.stores.checkpoints.load_latest(&run_id)? {
                if checkpoint.is_paused() || checkpoint.next_node.is_none() {
                    continue;
                }
            }
            let graph = match self.graph(&record.graph_name) {
                Ok(graph) => graph,
                Err(_) => {
                    tracing::warn!(run_id = %run_id, graph = %record.graph_name, "orphaned run references an unregistered graph");
                    continue;
                }
            };
            let Some(claim) = self.executor.drivers().try_claim(&run_id)? else {
                continue;
            };
            let ticket = match self.concurrency.admit(&run_id, &record.submitter) {
                Ok(ticket) => ticket,
                Err(AdmissionError::Rejected(reason)) => {
                    tracing::warn!(run_id = %run_id, %reason, "orphaned run not readmitted");
                    continue;
                }
                Err(AdmissionError::Store(e)) => return Err(e.into()),
            };
            self.ensure_tracked(&record)?;
            self.executor.record(
                &run_id,
                EventKind::Resumed,
                "recovery",
                json!({ "reason": "orphaned" }),
            );
            self.executor.spawn(graph, ticket, claim);
            tracing::info!(run_id = %run_id, state = %record.state, "orphaned run re-driven");
            report.resumed.push(run_id);
        }
        Ok(report)
    }
}

/// Run state is always a JSON object; other payloads are wrapped under `input`.
fn normalize_input(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        Value::Null => json!({}),
        other => json!({ "input": other }),
    }
}
