//! Runtime domain models: persisted run/attempt records and the read models callers see.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_kernel::{AttemptId, FailureRecord, NodeId, PendingInterrupt, RunEvent, RunId, RunState, Seq};

/// Persisted run record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub graph_name: String,
    pub submitter: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Sequence of the latest checkpoint.
    pub checkpoint_ref: Option<Seq>,
    /// Parent run when this run was created by `retry`.
    pub retry_of: Option<RunId>,
    pub idempotency_key: Option<String>,
    pub input: Value,
    pub failures: Vec<FailureRecord>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<RunId>,
        graph_name: impl Into<String>,
        submitter: impl Into<String>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            graph_name: graph_name.into(),
            submitter: submitter.into(),
            state: RunState::Created,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            checkpoint_ref: None,
            retry_of: None,
            idempotency_key: None,
            input,
            failures: Vec::new(),
        }
    }

    pub fn legacy_status(&self) -> &'static str {
        self.state.legacy_status()
    }
}

/// State of one execution attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Running => "RUNNING",
            AttemptState::Paused => "PAUSED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Failed => "FAILED",
            AttemptState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<AttemptState> {
        [
            AttemptState::Running,
            AttemptState::Paused,
            AttemptState::Completed,
            AttemptState::Failed,
            AttemptState::Cancelled,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
    }
}

/// One (re)start of a run's execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub run_id: RunId,
    /// Monotonic per run, starting at 1.
    pub attempt_number: u32,
    pub state: AttemptState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Filter for `list_runs`; results are newest first.
#[derive(Clone, Debug)]
pub struct RunFilter {
    pub graph_name: Option<String>,
    pub state: Option<RunState>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            graph_name: None,
            state: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunProgress {
    pub completed_steps: u32,
    pub current_node: Option<NodeId>,
}

/// Run status as seen by callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunInfo {
    pub run_id: RunId,
    pub graph_name: String,
    /// Run state, or `PAUSED` when the latest checkpoint carries a pending interrupt.
    pub status: String,
    pub run_state: String,
    pub legacy_status: String,
    pub progress: RunProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[schemars(with = "Option<Value>")]
    pub pending_interrupt: Option<PendingInterrupt>,
    pub retry_of: Option<RunId>,
    /// Latest checkpointed state (slimmed).
    pub state: Value,
}

pub const PAUSED: &str = "PAUSED";

impl RunInfo {
    pub fn is_paused(&self) -> bool {
        self.status == PAUSED
    }

    pub fn is_terminal(&self) -> bool {
        RunState::parse(&self.run_state).is_some_and(|s| s.is_terminal())
    }
}

/// One page of a run's event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventPage {
    #[schemars(with = "Vec<Value>")]
    pub events: Vec<RunEvent>,
    /// Cursor to pass as `after_seq` on the next call.
    pub next_seq: Seq,
}

/// A run waiting on an interrupt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PausedRun {
    pub run_id: RunId,
    pub graph_name: String,
    #[schemars(with = "Value")]
    pub interrupt: PendingInterrupt,
    pub paused_at: DateTime<Utc>,
}
