//! Storage facade for runs, attempts, the durable event log and idempotency keys.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use conductor_kernel::{
    check_transition, EventDraft, FailureRecord, KernelError, RunEvent, RunId, RunState, Seq,
    TransitionOutcome,
};

use crate::models::{AttemptRecord, AttemptState, RunFilter, RunRecord};

/// Run repository contract used by the executor and the orchestrator facade.
///
/// Implementations must make `transition` atomic: read the current state, validate the edge
/// with [check_transition] and write the new state under one lock or transaction. Illegal
/// transitions leave the record untouched and return `valid = false`.
pub trait RunRepository: Send + Sync {
    /// Inserts a new run; fails if `run_id` already exists.
    fn insert_run(&self, record: &RunRecord) -> Result<(), KernelError>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, KernelError>;

    fn transition(&self, run_id: &RunId, next: RunState) -> Result<TransitionOutcome, KernelError>;

    fn set_error(&self, run_id: &RunId, error: Option<String>) -> Result<(), KernelError>;

    fn set_checkpoint_ref(&self, run_id: &RunId, seq: Seq) -> Result<(), KernelError>;

    fn append_failure(&self, run_id: &RunId, failure: &FailureRecord) -> Result<(), KernelError>;

    /// Newest first.
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, KernelError>;

    fn list_non_terminal(&self) -> Result<Vec<RunRecord>, KernelError>;

    /// Creates the next attempt (number = previous max + 1) in RUNNING.
    fn create_attempt(&self, run_id: &RunId) -> Result<AttemptRecord, KernelError>;

    fn finish_attempt(
        &self,
        attempt_id: &str,
        state: AttemptState,
        error: Option<String>,
    ) -> Result<(), KernelError>;

    fn list_attempts(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, KernelError>;

    /// Appends to the durable event log, assigning the next per-run `seq`.
    fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<RunEvent, KernelError>;

    fn list_events(
        &self,
        run_id: &RunId,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<RunEvent>, KernelError>;

    fn lookup_idempotency_key(&self, key: &str) -> Result<Option<RunId>, KernelError>;

    /// Binds (or rebinds) an idempotency key to a run.
    fn bind_idempotency_key(&self, key: &str, run_id: &RunId) -> Result<(), KernelError>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, RunRecord>,
    attempts: Vec<AttemptRecord>,
    events: HashMap<RunId, Vec<RunEvent>>,
    keys: HashMap<String, RunId>,
}

/// In-memory repository (default backend and tests).
#[derive(Default)]
pub struct InMemoryRunRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, KernelError> {
        self.state
            .read()
            .map_err(|e| KernelError::Repository(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, KernelError> {
        self.state
            .write()
            .map_err(|e| KernelError::Repository(e.to_string()))
    }

    fn with_run<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord) -> T,
    ) -> Result<T, KernelError> {
        let mut guard = self.write()?;
        let run = guard
            .runs
            .get_mut(run_id)
            .ok_or_else(|| KernelError::RunNotFound(run_id.clone()))?;
        let out = f(run);
        run.updated_at = Utc::now();
        Ok(out)
    }
}

impl RunRepository for InMemoryRunRepository {
    fn insert_run(&self, record: &RunRecord) -> Result<(), KernelError> {
        let mut guard = self.write()?;
        if guard.runs.contains_key(&record.run_id) {
            return Err(KernelError::Repository(format!(
                "run already exists: {}",
                record.run_id
            )));
        }
        guard.runs.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, KernelError> {
        Ok(self.read()?.runs.get(run_id).cloned())
    }

    fn transition(&self, run_id: &RunId, next: RunState) -> Result<TransitionOutcome, KernelError> {
        let mut guard = self.write()?;
        let run = guard
            .runs
            .get_mut(run_id)
            .ok_or_else(|| KernelError::RunNotFound(run_id.clone()))?;
        let outcome = check_transition(run.state, next);
        if outcome.changed() {
            let now = Utc::now();
            run.state = outcome.current;
            run.updated_at = now;
            if outcome.current.is_terminal() {
                run.completed_at = Some(now);
            }
        }
        Ok(outcome)
    }

    fn set_error(&self, run_id: &RunId, error: Option<String>) -> Result<(), KernelError> {
        self.with_run(run_id, |run| run.error = error)
    }

    fn set_checkpoint_ref(&self, run_id: &RunId, seq: Seq) -> Result<(), KernelError> {
        self.with_run(run_id, |run| run.checkpoint_ref = Some(seq))
    }

    fn append_failure(&self, run_id: &RunId, failure: &FailureRecord) -> Result<(), KernelError> {
        self.with_run(run_id, |run| run.failures.push(failure.clone()))
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, KernelError> {
        let guard = self.read()?;
        let mut runs: Vec<RunRecord> = guard
            .runs
            .values()
            .filter(|r| filter.graph_name.as_ref().map_or(true, |g| &r.graph_name == g))
            .filter(|r| filter.state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    fn list_non_terminal(&self) -> Result<Vec<RunRecord>, KernelError> {
        let guard = self.read()?;
        let mut runs: Vec<RunRecord> = guard
            .runs
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    fn create_attempt(&self, run_id: &RunId) -> Result<AttemptRecord, KernelError> {
        let mut guard = self.write()?;
        if !guard.runs.contains_key(run_id) {
            return Err(KernelError::RunNotFound(run_id.clone()));
        }
        let attempt_number = guard
            .attempts
            .iter()
            .filter(|a| &a.run_id == run_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0)
            + 1;
        let attempt = AttemptRecord {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            attempt_number,
            state: AttemptState::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        guard.attempts.push(attempt.clone());
        Ok(attempt)
    }

    fn finish_attempt(
        &self,
        attempt_id: &str,
        state: AttemptState,
        error: Option<String>,
    ) -> Result<(), KernelError> {
        let mut guard = self.write()?;
        let attempt = guard
            .attempts
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| KernelError::Repository(format!("attempt not found: {attempt_id}")))?;
        attempt.state = state;
        attempt.error = error;
        attempt.finished_at = Some(Utc::now());
        Ok(())
    }

    fn list_attempts(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, KernelError> {
        let guard = self.read()?;
        let mut attempts: Vec<AttemptRecord> = guard
            .attempts
            .iter()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<RunEvent, KernelError> {
        let mut guard = self.write()?;
        let log = guard.events.entry(run_id.clone()).or_default();
        let seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        let event = RunEvent {
            run_id: run_id.clone(),
            seq,
            kind: draft.kind,
            name: draft.name,
            data: draft.data,
            timestamp: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    fn list_events(
        &self,
        run_id: &RunId,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<RunEvent>, KernelError> {
        let guard = self.read()?;
        Ok(guard
            .events
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn lookup_idempotency_key(&self, key: &str) -> Result<Option<RunId>, KernelError> {
        Ok(self.read()?.keys.get(key).cloned())
    }

    fn bind_idempotency_key(&self, key: &str, run_id: &RunId) -> Result<(), KernelError> {
        self.write()?.keys.insert(key.to_string(), run_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use conductor_kernel::{EventKind, StepError};

    use super::*;

    fn repo_with_run(run_id: &str) -> InMemoryRunRepository {
        let repo = InMemoryRunRepository::new();
        repo.insert_run(&RunRecord::new(run_id, "grading", "alice", json!({})))
            .unwrap();
        repo
    }

    #[test]
    fn transition_follows_edge_table_and_stamps_completion() {
        let repo = repo_with_run("r1");
        let id = "r1".to_string();
        let bad = repo.transition(&id, RunState::Completed).unwrap();
        assert!(!bad.valid);
        assert_eq!(repo.get_run(&id).unwrap().unwrap().state, RunState::Created);

        assert!(repo.transition(&id, RunState::Running).unwrap().valid);
        assert!(repo.transition(&id, RunState::Completed).unwrap().valid);
        let run = repo.get_run(&id).unwrap().unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert!(run.completed_at.is_some());
        assert!(!repo.transition(&id, RunState::Running).unwrap().valid);
    }

    #[test]
    fn transition_unknown_run_is_not_found() {
        let repo = InMemoryRunRepository::new();
        let err = repo
            .transition(&"ghost".to_string(), RunState::Running)
            .unwrap_err();
        assert!(matches!(err, KernelError::RunNotFound(_)));
    }

    #[test]
    fn duplicate_insert_fails() {
        let repo = repo_with_run("r1");
        assert!(repo
            .insert_run(&RunRecord::new("r1", "grading", "bob", json!({})))
            .is_err());
    }

    #[test]
    fn attempts_are_numbered_per_run() {
        let repo = repo_with_run("r1");
        let id = "r1".to_string();
        let a1 = repo.create_attempt(&id).unwrap();
        repo.finish_attempt(&a1.attempt_id, AttemptState::Paused, None)
            .unwrap();
        let a2 = repo.create_attempt(&id).unwrap();
        assert_eq!((a1.attempt_number, a2.attempt_number), (1, 2));
        let listed = repo.list_attempts(&id).unwrap();
        assert_eq!(listed[0].state, AttemptState::Paused);
        assert_eq!(listed[1].state, AttemptState::Running);
    }

    #[test]
    fn events_are_sequenced_and_paged() {
        let repo = repo_with_run("r1");
        let id = "r1".to_string();
        for i in 0..5 {
            let e = repo
                .append_event(&id, EventDraft::new(EventKind::NodeCompleted, format!("n{i}"), json!({})))
                .unwrap();
            assert_eq!(e.seq, i + 1);
        }
        let page = repo.list_events(&id, 2, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn failures_and_keys_are_recorded() {
        let repo = repo_with_run("r1");
        let id = "r1".to_string();
        let failure = FailureRecord::new("score", &StepError::new("Error", "timeout"), 1);
        repo.append_failure(&id, &failure).unwrap();
        assert_eq!(repo.get_run(&id).unwrap().unwrap().failures, vec![failure]);

        repo.bind_idempotency_key("key-1", &id).unwrap();
        assert_eq!(repo.lookup_idempotency_key("key-1").unwrap(), Some(id));
        assert_eq!(repo.lookup_idempotency_key("key-2").unwrap(), None);
    }

    #[test]
    fn list_runs_filters_newest_first() {
        let repo = InMemoryRunRepository::new();
        let mut older = RunRecord::new("a", "grading", "alice", json!({}));
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        repo.insert_run(&older).unwrap();
        repo.insert_run(&RunRecord::new("b", "grading", "alice", json!({})))
            .unwrap();
        repo.insert_run(&RunRecord::new("c", "other", "alice", json!({})))
            .unwrap();

        let filter = RunFilter {
            graph_name: Some("grading".into()),
            ..RunFilter::default()
        };
        let runs = repo.list_runs(&filter).unwrap();
        assert_eq!(runs.iter().map(|r| r.run_id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
