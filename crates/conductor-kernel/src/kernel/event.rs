//! Sequenced run events and the kernel error type.
//!
//! Events are immutable once appended; every event carries the per-run `seq` it was
//! assigned at append time, and readers page through them with that cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::identity::{RunId, Seq};

/// Kind of a run event. Quality metrics are computed from these kinds alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStarted,
    StateChanged,
    NodeStarted,
    NodeCompleted,
    StepStarted,
    StepRetry,
    StepFailed,
    FallbackApplied,
    ReviewTriggered,
    CheckpointSaved,
    Interrupted,
    Resumed,
    Signal,
    StreamChunk,
    ModelUsage,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunCreated => "run_created",
            EventKind::RunStarted => "run_started",
            EventKind::StateChanged => "state_changed",
            EventKind::NodeStarted => "node_started",
            EventKind::NodeCompleted => "node_completed",
            EventKind::StepStarted => "step_started",
            EventKind::StepRetry => "step_retry",
            EventKind::StepFailed => "step_failed",
            EventKind::FallbackApplied => "fallback_applied",
            EventKind::ReviewTriggered => "review_triggered",
            EventKind::CheckpointSaved => "checkpoint_saved",
            EventKind::Interrupted => "interrupted",
            EventKind::Resumed => "resumed",
            EventKind::Signal => "signal",
            EventKind::StreamChunk => "stream_chunk",
            EventKind::ModelUsage => "model_usage",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunFailed => "run_failed",
            EventKind::RunCancelled => "run_cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event that has not been sequenced yet (what steps and the executor emit).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventDraft {
    pub kind: EventKind,
    pub name: String,
    pub data: Value,
}

impl EventDraft {
    pub fn new(kind: EventKind, name: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            data,
        }
    }
}

/// A sequenced, immutable run event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: Seq,
    pub kind: EventKind,
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Sink for events produced while a step runs (stream chunks, model usage).
///
/// The executor hands steps an implementation that sequences and stores the event.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, run_id: &RunId, draft: EventDraft) -> Result<Seq, KernelError>;
}

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("EventStore error: {0}")]
    EventStore(String),
    #[error("CheckpointStore error: {0}")]
    CheckpointStore(String),
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("Driver error: {0}")]
    Driver(String),
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Serialization(e.to_string())
    }
}
