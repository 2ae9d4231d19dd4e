//! Artifacts: payloads elided from checkpoints, addressable by run and JSON pointer.
//!
//! Each checkpoint owns the artifact set written with its `sequence`. A new set is stored
//! before the checkpoint that references it and older sets are dropped only after that
//! checkpoint committed, so a failed checkpoint write leaves the previous pairing intact.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::event::KernelError;
use crate::kernel::identity::{RunId, Seq};

/// Reference to an elided payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// JSON pointer of the elided field within the run state.
    pub artifact_id: String,
    /// `artifact://{run_id}{pointer}`.
    pub uri: String,
    pub content_hash: Option<String>,
    /// kind, size or count, item_type.
    pub metadata: Value,
}

/// A reference paired with the content it stands for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(flatten)]
    pub reference: ArtifactRef,
    pub content: Value,
}

/// Out-of-band store for artifact content, one set per checkpoint sequence.
pub trait ArtifactStore: Send + Sync {
    /// Stores the set written with checkpoint `sequence`, replacing any set already stored
    /// under that sequence.
    fn put(&self, run_id: &RunId, sequence: Seq, artifacts: &[Artifact]) -> Result<(), KernelError>;
    fn get(
        &self,
        run_id: &RunId,
        sequence: Seq,
        artifact_id: &str,
    ) -> Result<Option<Artifact>, KernelError>;
    fn list(&self, run_id: &RunId, sequence: Seq) -> Result<Vec<Artifact>, KernelError>;
    /// Drops every set of the run except the one stored under `sequence`.
    fn retain_only(&self, run_id: &RunId, sequence: Seq) -> Result<usize, KernelError>;
    fn delete_run(&self, run_id: &RunId) -> Result<(), KernelError>;
}

type ArtifactSets = HashMap<RunId, BTreeMap<Seq, Vec<Artifact>>>;

#[derive(Default)]
pub struct InMemoryArtifactStore {
    by_run: RwLock<ArtifactSets>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, run_id: &RunId, sequence: Seq, artifacts: &[Artifact]) -> Result<(), KernelError> {
        let mut guard = self
            .by_run
            .write()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        guard
            .entry(run_id.clone())
            .or_default()
            .insert(sequence, artifacts.to_vec());
        Ok(())
    }

    fn get(
        &self,
        run_id: &RunId,
        sequence: Seq,
        artifact_id: &str,
    ) -> Result<Option<Artifact>, KernelError> {
        let guard = self
            .by_run
            .read()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        Ok(guard
            .get(run_id)
            .and_then(|sets| sets.get(&sequence))
            .and_then(|list| list.iter().find(|a| a.reference.artifact_id == artifact_id))
            .cloned())
    }

    fn list(&self, run_id: &RunId, sequence: Seq) -> Result<Vec<Artifact>, KernelError> {
        let guard = self
            .by_run
            .read()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        Ok(guard
            .get(run_id)
            .and_then(|sets| sets.get(&sequence))
            .cloned()
            .unwrap_or_default())
    }

    fn retain_only(&self, run_id: &RunId, sequence: Seq) -> Result<usize, KernelError> {
        let mut guard = self
            .by_run
            .write()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        let Some(sets) = guard.get_mut(run_id) else {
            return Ok(0);
        };
        let before = sets.len();
        sets.retain(|seq, _| *seq == sequence);
        Ok(before - sets.len())
    }

    fn delete_run(&self, run_id: &RunId) -> Result<(), KernelError> {
        let mut guard = self
            .by_run
            .write()
            .map_err(|e| KernelError::CheckpointStore(e.to_string()))?;
        guard.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pages(content: Value) -> Artifact {
        Artifact {
            reference: ArtifactRef {
                artifact_id: "/pages".into(),
                uri: "artifact://run-1/pages".into(),
                content_hash: None,
                metadata: json!({ "kind": "list_ref" }),
            },
            content,
        }
    }

    #[test]
    fn older_set_stays_readable_until_retained_away() {
        let store = InMemoryArtifactStore::new();
        let run = "run-1".to_string();
        store.put(&run, 2, &[pages(json!([1, 2, 3]))]).unwrap();
        store.put(&run, 3, &[pages(json!([4, 5]))]).unwrap();

        assert_eq!(store.get(&run, 2, "/pages").unwrap().unwrap().content, json!([1, 2, 3]));
        assert_eq!(store.list(&run, 3).unwrap()[0].content, json!([4, 5]));

        assert_eq!(store.retain_only(&run, 3).unwrap(), 1);
        assert!(store.list(&run, 2).unwrap().is_empty());
        assert_eq!(store.list(&run, 3).unwrap().len(), 1);
    }
}
