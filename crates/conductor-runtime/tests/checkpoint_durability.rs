//! A checkpoint write that fails after the node's artifacts were stored must leave the last
//! committed checkpoint and its artifacts usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conductor_kernel::{
    step_fn, CheckpointSnapshot, CheckpointStore, InMemoryArtifactStore, InMemoryCheckpointStore,
    KernelError, RegisteredStep, RunId, StepOutcome, StepRegistry,
};
use conductor_runtime::{
    EngineConfig, GraphBuilder, InMemoryCountingStore, InMemoryRunRepository, Orchestrator,
};

const SETTLE: Duration = Duration::from_secs(10);

/// Rejects the first save of a checkpoint taken after `fail_after_steps` completed nodes.
struct FailOnce {
    inner: InMemoryCheckpointStore,
    fail_after_steps: u32,
    armed: AtomicBool,
}

impl CheckpointStore for FailOnce {
    fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), KernelError> {
        if snapshot.completed_steps == self.fail_after_steps && self.armed.swap(false, Ordering::SeqCst) {
            return Err(KernelError::CheckpointStore("disk full".to_string()));
        }
        self.inner.save(snapshot)
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<CheckpointSnapshot>, KernelError> {
        self.inner.load_latest(run_id)
    }

    fn delete(&self, run_id: &RunId) -> Result<(), KernelError> {
        self.inner.delete(run_id)
    }

    fn list_paused(&self) -> Result<Vec<CheckpointSnapshot>, KernelError> {
        self.inner.list_paused()
    }
}

fn registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry
        .register(RegisteredStep::new(
            "scan",
            step_fn(|_ctx, _state| async move {
                Ok(StepOutcome::Update(json!({ "pages": ["p1", "p2", "p3"] })))
            }),
        ))
        .register(RegisteredStep::new(
            "regrade",
            step_fn(|_ctx, state| async move {
                Ok(StepOutcome::Update(json!({
                    "seen_pages": state["pages"].clone(),
                    "pages": ["r1", "r2", "r3", "r4"],
                })))
            }),
        ))
        .register(RegisteredStep::new(
            "publish",
            step_fn(|_ctx, _state| async move {
                Ok(StepOutcome::Update(json!({ "published": true })))
            }),
        ));
    registry
}

#[tokio::test]
async fn retry_after_a_failed_checkpoint_write_rehydrates_the_committed_state() {
    let checkpoints = Arc::new(FailOnce {
        inner: InMemoryCheckpointStore::new(),
        fail_after_steps: 2,
        armed: AtomicBool::new(true),
    });
    let orch = Orchestrator::with_stores(
        registry(),
        EngineConfig::default(),
        Arc::new(InMemoryRunRepository::new()),
        checkpoints,
        Arc::new(InMemoryArtifactStore::new()),
        Arc::new(InMemoryCountingStore::new()),
    );
    orch.register_graph(
        GraphBuilder::new("exam")
            .node("scan", "scan")
            .node("regrade", "regrade")
            .node("publish", "publish")
            .entry("scan")
            .edge("scan", "regrade")
            .edge("regrade", "publish")
            .exit("publish"),
    )
    .unwrap();

    let run_id = orch.start_run("exam", json!({}), None).await.unwrap();
    let failed = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(failed.status, "FAILED");
    assert!(failed.error.unwrap_or_default().contains("disk full"));
    assert_eq!(failed.progress.current_node.as_deref(), Some("regrade"));

    // The committed checkpoint still resolves to the pages it was written with.
    let pages = orch.get_run_artifact(&run_id, "/pages").unwrap().unwrap();
    assert_eq!(pages.content, json!(["p1", "p2", "p3"]));

    let retried = orch.retry(&run_id).await.unwrap();
    let done = orch.wait_until_settled(&retried, SETTLE).await.unwrap();
    assert_eq!(done.status, "COMPLETED");
    assert_eq!(done.state["seen_pages"], json!(["p1", "p2", "p3"]));
    assert_eq!(done.state["pages"]["count"], 4);
    assert_eq!(done.state["published"], true);
}
