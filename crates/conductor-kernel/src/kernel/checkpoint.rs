//! Checkpoint store: the latest durable snapshot of each run.
//!
//! A checkpoint is overwritten after every step boundary and every interrupt. Only the latest
//! one is used for resume; `(next_node, pending_interrupt)` is the saved continuation.
//! Checkpoints for one run are written by a single logical writer, so a save carrying an
//! older `sequence` than the stored one is rejected.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::event::KernelError;
use crate::kernel::identity::{NodeId, RunId, Seq};
use crate::kernel::interrupt::{PendingInterrupt, Signal};

/// Latest persisted state of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub run_id: RunId,
    pub sequence: Seq,
    /// Node to execute next; `None` once the run reached an exit.
    pub next_node: Option<NodeId>,
    /// Slimmed run state.
    pub sanitized_state: Value,
    pub pending_interrupt: Option<PendingInterrupt>,
    /// Resume data waiting to be handed to `next_node`.
    pub resume: Option<Signal>,
    /// Out-of-band signals waiting to be handed to the next node.
    #[serde(default)]
    pub signals: Vec<Signal>,
    pub completed_steps: u32,
    pub partial: bool,
    /// Coarse slimming profile was applied.
    #[serde(default)]
    pub coarse: bool,
    /// Sequence of the artifact set this snapshot's refs resolve against.
    #[serde(default)]
    pub artifact_sequence: Seq,
    pub created_at: DateTime<Utc>,
}

impl CheckpointSnapshot {
    pub fn initial(run_id: impl Into<RunId>, entry: impl Into<NodeId>, state: Value) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: 0,
            next_node: Some(entry.into()),
            sanitized_state: state,
            pending_interrupt: None,
            resume: None,
            signals: Vec::new(),
            completed_steps: 0,
            partial: false,
            coarse: false,
            artifact_sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pending_interrupt.is_some()
    }
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), KernelError>;
    fn load_latest(&self, run_id: &RunId) -> Result<Option<CheckpointSnapshot>, KernelError>;
    fn delete(&self, run_id: &RunId) -> Result<(), KernelError>;
    /// Runs whose latest checkpoint carries a pending interrupt.
    fn list_paused(&self) -> Result<Vec<CheckpointSnapshot>, KernelError>;
}

/// In-memory checkpoint store: one snapshot per run (latest overwrites).
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    latest: RwLock<HashMap<RunId, CheckpointSnapshot>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), KernelError> {
        let mut guard = self
            .latest
            .write()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        if let Some(existing) = guard.get(&snapshot.run_id) {
            if existing.sequence > snapshot.sequence {
                return Err(KernelError::CheckpointStore(format!(
                    "stale checkpoint for {}: sequence {} < {}",
                    snapshot.run_id, snapshot.sequence, existing.sequence
                )));
            }
        }
        guard.insert(snapshot.run_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<CheckpointSnapshot>, KernelError> {
        let guard = self
            .latest
            .read()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        Ok(guard.get(run_id).cloned())
    }

    fn delete(&self, run_id: &RunId) -> Result<(), KernelError> {
        let mut guard = self
            .latest
            .write()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        guard.remove(run_id);
        Ok(())
    }

    fn list_paused(&self) -> Result<Vec<CheckpointSnapshot>, KernelError> {
        let guard = self
            .latest
            .read()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        let mut paused: Vec<CheckpointSnapshot> =
            guard.values().filter(|s| s.is_paused()).cloned().collect();
        paused.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(paused)
    }
}
