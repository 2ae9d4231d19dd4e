//! End-to-end run lifecycle through the orchestrator facade (in-memory stores).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use conductor_kernel::{
    interrupt, step_fn, EventKind, FlagForReview, InterruptKind, RegisteredStep, RetryPolicy,
    StepError, StepOutcome, StepRegistry,
};
use conductor_runtime::{
    EngineConfig, GraphBuilder, Orchestrator, OrchestratorError, RunFilter, PAUSED,
};

const SETTLE: Duration = Duration::from_secs(10);

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5), attempts)
}

fn noop(name: &str) -> RegisteredStep {
    RegisteredStep::new(
        name,
        step_fn(|ctx, _state| async move {
            let mut patch = Map::new();
            patch.insert(ctx.node.clone(), Value::Bool(true));
            Ok(StepOutcome::Update(Value::Object(patch)))
        }),
    )
}

/// Pauses for approval on first entry; records the reviewer once resumed.
fn approval() -> RegisteredStep {
    RegisteredStep::new(
        "approval",
        step_fn(|ctx, state| async move {
            match ctx.resume_value() {
                Some(data) => Ok(StepOutcome::Update(json!({
                    "approved_by": data["reviewer"],
                    "page_count": state["pages"].as_array().map(|p| p.len()),
                }))),
                None => Ok(interrupt(json!({ "question": "approve grade?" }))),
            }
        }),
    )
}

fn review_graph() -> GraphBuilder {
    GraphBuilder::new("review")
        .node("draft", "draft")
        .node("approval", "approval")
        .node("publish", "publish")
        .entry("draft")
        .edge("draft", "approval")
        .edge("approval", "publish")
        .exit("publish")
}

fn review_orchestrator(config: EngineConfig) -> Orchestrator {
    let mut registry = StepRegistry::new();
    registry
        .register(noop("draft"))
        .register(approval())
        .register(noop("publish"));
    let orchestrator = Orchestrator::new(registry, config);
    orchestrator.register_graph(review_graph()).unwrap();
    orchestrator
}

fn event_kinds(orch: &Orchestrator, run_id: &str) -> Vec<EventKind> {
    orch.get_run_events(run_id, 0, 10_000)
        .unwrap()
        .events
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn same_idempotency_key_yields_one_run_and_one_attempt() {
    let orch = review_orchestrator(EngineConfig::default());
    let run_id = orch
        .start_run("review", json!({ "essay": "e-42" }), Some("essay-42"))
        .await
        .unwrap();
    assert_eq!(run_id, "essay-42");

    match orch.start_run("review", json!({ "essay": "e-42" }), Some("essay-42")).await {
        Err(OrchestratorError::AlreadyExists { run_id: existing }) => assert_eq!(existing, run_id),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(info.status, PAUSED);
    assert_eq!(orch.list_attempts(&run_id).unwrap().len(), 1);

    // Still non-terminal while paused.
    assert!(matches!(
        orch.start_run("review", json!({}), Some("essay-42")).await,
        Err(OrchestratorError::AlreadyExists { .. })
    ));

    assert!(orch.send_event(&run_id, "approve", json!({ "reviewer": "kim" })).await.unwrap());
    let done = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(done.status, "COMPLETED");

    let rebound = orch
        .start_run("review", json!({}), Some("essay-42"))
        .await
        .unwrap();
    assert_ne!(rebound, run_id);
    assert!(rebound.starts_with("essay-42-"));
}

#[tokio::test]
async fn interrupted_run_reports_paused_and_resumes_with_injected_data() {
    let orch = review_orchestrator(EngineConfig::default());
    let pages: Vec<Value> = (0..3).map(|i| json!(format!("page-{i}"))).collect();
    let run_id = orch
        .start_run("review", json!({ "pages": pages }), None)
        .await
        .unwrap();

    let paused = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(paused.status, PAUSED);
    assert_eq!(paused.run_state, "RUNNING");
    let pending = paused.pending_interrupt.clone().unwrap();
    assert_eq!(pending.node, "approval");
    assert_eq!(pending.kind, InterruptKind::Dynamic);
    assert_eq!(pending.payload["question"], "approve grade?");
    assert_eq!(paused.progress.current_node.as_deref(), Some("approval"));
    // Heavy list field is slimmed in the checkpoint.
    assert_eq!(paused.state["pages"]["kind"], "list_ref");
    assert_eq!(paused.state["pages"]["count"], 3);

    let listed = orch.list_pending_interrupts().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, run_id);

    assert!(orch
        .send_event(&run_id, "approve", json!({ "reviewer": "ana" }))
        .await
        .unwrap());
    let done = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(done.status, "COMPLETED");
    assert_eq!(done.state["approved_by"], "ana");
    // The resumed node saw the rehydrated list, not the reference.
    assert_eq!(done.state["page_count"], 3);
    assert!(done.pending_interrupt.is_none());
    assert!(orch.list_pending_interrupts().unwrap().is_empty());

    let attempts = orch.list_attempts(&run_id).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].state.as_str(), "PAUSED");
    assert_eq!(attempts[1].state.as_str(), "COMPLETED");

    let kinds = event_kinds(&orch, &run_id);
    assert!(kinds.contains(&EventKind::Interrupted));
    assert!(kinds.contains(&EventKind::Resumed));
    assert_eq!(kinds.last(), Some(&EventKind::RunCompleted));

    let artifact = orch.get_run_artifact(&run_id, "/pages").unwrap().unwrap();
    assert_eq!(artifact.reference.uri, format!("artifact://{run_id}/pages"));
    assert_eq!(artifact.content.as_array().map(|a| a.len()), Some(3));

    assert!(!orch.send_event(&run_id, "approve", json!({})).await.unwrap());
}

#[tokio::test]
async fn static_interrupt_point_pauses_before_the_node() {
    let mut registry = StepRegistry::new();
    registry.register(noop("draft")).register(noop("publish"));
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("gated")
            .node("draft", "draft")
            .node("publish", "publish")
            .entry("draft")
            .edge("draft", "publish")
            .exit("publish")
            .interrupt_before("publish"),
    )
    .unwrap();

    let run_id = orch.start_run("gated", json!({}), None).await.unwrap();
    let paused = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(paused.status, PAUSED);
    let pending = paused.pending_interrupt.unwrap();
    assert_eq!(pending.kind, InterruptKind::Breakpoint);
    assert_eq!(pending.node, "publish");
    assert_eq!(paused.state["draft"], true);
    assert!(paused.state.get("publish").is_none());

    assert!(orch.send_event(&run_id, "continue", json!({})).await.unwrap());
    let done = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(done.status, "COMPLETED");
    assert_eq!(done.state["publish"], true);
}

#[tokio::test]
async fn permanently_failing_step_runs_exactly_n_attempts_then_falls_back() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = StepRegistry::new();
    registry.register(
        RegisteredStep::new(
            "score",
            step_fn(move |_ctx, _state| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<StepOutcome, _>(StepError::new("ModelError", "garbled output"))
                }
            }),
        )
        .with_retry(fast_retry(3))
        .with_fallback(FlagForReview),
    );
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(GraphBuilder::new("score").node("score", "score").entry("score").exit("score"))
        .unwrap();

    let run_id = orch.start_run("score", json!({}), None).await.unwrap();
    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(info.status, "COMPLETED");
    assert_eq!(info.state["needs_review"], true);

    let metrics = orch.get_run_metrics(&run_id).unwrap();
    assert_eq!(metrics.quality.step_started, 3);
    assert_eq!(metrics.quality.step_failed, 3);
    assert_eq!(metrics.quality.step_retry, 2);
    assert_eq!(metrics.quality.review_triggered, 1);
    assert!((metrics.quality.review_trigger_rate - 1.0).abs() < f64::EPSILON);

    let kinds = event_kinds(&orch, &run_id);
    assert!(kinds.contains(&EventKind::FallbackApplied));
    assert!(kinds.contains(&EventKind::StateChanged));
}

#[tokio::test]
async fn non_retryable_failure_fails_fast_and_retry_chains_from_the_checkpoint() {
    let healed = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));
    let (flag, counter) = (Arc::clone(&healed), Arc::clone(&calls));
    let mut registry = StepRegistry::new();
    registry.register(noop("prepare")).register(
        RegisteredStep::new(
            "upload",
            step_fn(move |_ctx, _state| {
                let (flag, counter) = (Arc::clone(&flag), Arc::clone(&counter));
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if flag.load(Ordering::SeqCst) {
                        Ok(StepOutcome::Update(json!({ "uploaded": true })))
                    } else {
                        Err(StepError::new("StorageError", "permission denied for bucket"))
                    }
                }
            }),
        )
        .with_retry(fast_retry(5)),
    );
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("upload")
            .node("prepare", "prepare")
            .node("upload", "upload")
            .entry("prepare")
            .edge("prepare", "upload")
            .exit("upload"),
    )
    .unwrap();

    let failed_id = orch.start_run("upload", json!({ "doc": 1 }), None).await.unwrap();
    let failed = orch.wait_until_settled(&failed_id, SETTLE).await.unwrap();
    assert_eq!(failed.status, "FAILED");
    assert_eq!(failed.legacy_status, "failed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let error = failed.error.unwrap();
    assert!(error.contains("StorageError"), "{error}");
    assert!(error.contains("permission denied"), "{error}");
    assert_eq!(orch.list_attempts(&failed_id).unwrap()[0].state.as_str(), "FAILED");

    healed.store(true, Ordering::SeqCst);
    let retry_id = orch.retry(&failed_id).await.unwrap();
    assert_ne!(retry_id, failed_id);
    let retried = orch.wait_until_settled(&retry_id, SETTLE).await.unwrap();
    assert_eq!(retried.status, "COMPLETED");
    assert_eq!(retried.retry_of.as_deref(), Some(failed_id.as_str()));
    assert_eq!(retried.state["prepare"], true);
    assert_eq!(retried.state["uploaded"], true);
    // `prepare` was not executed again.
    assert_eq!(retried.progress.completed_steps, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let chained = orch
        .list_runs(&RunFilter {
            graph_name: Some("upload".into()),
            ..RunFilter::default()
        })
        .unwrap();
    assert_eq!(chained.len(), 2);
}

#[tokio::test]
async fn cancellation_discards_the_running_node_result() {
    let started = Arc::new(Notify::new());
    let after_ran = Arc::new(AtomicBool::new(false));
    let (notify, ran) = (Arc::clone(&started), Arc::clone(&after_ran));
    let mut registry = StepRegistry::new();
    registry
        .register(RegisteredStep::new(
            "slow",
            step_fn(move |ctx, _state| {
                let notify = Arc::clone(&notify);
                async move {
                    notify.notify_one();
                    for _ in 0..500 {
                        if ctx.is_cancelled() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(StepOutcome::Update(json!({ "slow": "done" })))
                }
            }),
        ))
        .register(RegisteredStep::new(
            "after",
            step_fn(move |_ctx, _state| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(StepOutcome::Update(json!({})))
                }
            }),
        ));
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("slow")
            .node("slow", "slow")
            .node("after", "after")
            .entry("slow")
            .edge("slow", "after")
            .exit("after"),
    )
    .unwrap();

    let run_id = orch.start_run("slow", json!({}), None).await.unwrap();
    tokio::time::timeout(SETTLE, started.notified()).await.unwrap();
    assert!(orch.cancel(&run_id).unwrap());

    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(info.status, "CANCELLED");
    assert!(info.state.get("slow").is_none());
    assert!(!after_ran.load(Ordering::SeqCst));
    assert!(!orch.cancel(&run_id).unwrap());
    assert_eq!(orch.list_attempts(&run_id).unwrap()[0].state.as_str(), "CANCELLED");
    assert!(event_kinds(&orch, &run_id).contains(&EventKind::RunCancelled));
}

#[tokio::test]
async fn cancel_event_cancels_a_paused_run() {
    let orch = review_orchestrator(EngineConfig::default());
    let run_id = orch.start_run("review", json!({}), None).await.unwrap();
    assert_eq!(orch.wait_until_settled(&run_id, SETTLE).await.unwrap().status, PAUSED);

    assert!(orch.send_event(&run_id, "cancel", json!({})).await.unwrap());
    let info = orch.get_status(&run_id).unwrap();
    assert_eq!(info.status, "CANCELLED");
    assert!(orch.list_pending_interrupts().unwrap().is_empty());

    let retry_id = orch.retry(&run_id).await.unwrap();
    let retried = orch.wait_until_settled(&retry_id, SETTLE).await.unwrap();
    // Re-enters at the interrupted node and pauses there again.
    assert_eq!(retried.status, PAUSED);
}

#[tokio::test]
async fn partial_sub_item_failures_end_in_partial_failed() {
    let mut registry = StepRegistry::new();
    registry
        .register(RegisteredStep::new(
            "grade_pages",
            step_fn(|_ctx, _state| async {
                Ok(StepOutcome::Partial {
                    update: json!({ "graded": 2 }),
                    failures: vec!["page 3: unreadable scan".to_string()],
                })
            }),
        ))
        .register(noop("summarize"));
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("batch")
            .node("grade_pages", "grade_pages")
            .node("summarize", "summarize")
            .entry("grade_pages")
            .edge("grade_pages", "summarize")
            .exit("summarize"),
    )
    .unwrap();

    let run_id = orch.start_run("batch", json!({}), None).await.unwrap();
    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(info.status, "PARTIAL_FAILED");
    assert_eq!(info.legacy_status, "partial");
    assert_eq!(info.state["graded"], 2);
    assert_eq!(info.state["summarize"], true);
    assert!(info.progress.current_node.is_none());

    let retry_id = orch.retry(&run_id).await.unwrap();
    let retried = orch.wait_until_settled(&retry_id, SETTLE).await.unwrap();
    assert_eq!(retried.status, "PARTIAL_FAILED");
    assert_eq!(retried.progress.completed_steps, 2);
}

#[tokio::test]
async fn node_without_a_matching_edge_fails_with_no_route() {
    let mut registry = StepRegistry::new();
    registry.register(noop("classify")).register(noop("approve"));
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("route")
            .node("classify", "classify")
            .node("approve", "approve")
            .entry("classify")
            .edge_if("classify", "approve", |s| s["score"].as_u64().unwrap_or(0) > 5)
            .exit("approve"),
    )
    .unwrap();

    let run_id = orch.start_run("route", json!({ "score": 1 }), None).await.unwrap();
    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(info.status, "FAILED");
    assert!(info.error.unwrap().contains("no route from node classify"));

    let ok_id = orch.start_run("route", json!({ "score": 9 }), None).await.unwrap();
    assert_eq!(
        orch.wait_until_settled(&ok_id, SETTLE).await.unwrap().status,
        "COMPLETED"
    );
}

#[tokio::test]
async fn event_cursor_has_no_gaps_or_duplicates() {
    let config = EngineConfig {
        event_buffer_capacity: 16,
        ..EngineConfig::default()
    };
    let mut registry = StepRegistry::new();
    for name in ["a", "b", "c", "d", "e", "f"] {
        registry.register(noop(name));
    }
    let orch = Orchestrator::new(registry, config);
    orch.register_graph(
        GraphBuilder::new("chain")
            .node("a", "a")
            .node("b", "b")
            .node("c", "c")
            .node("d", "d")
            .node("e", "e")
            .node("f", "f")
            .entry("a")
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "d")
            .edge("d", "e")
            .edge("e", "f")
            .exit("f"),
    )
    .unwrap();
    let run_id = orch.start_run("chain", json!({}), None).await.unwrap();
    orch.wait_until_settled(&run_id, SETTLE).await.unwrap();

    // Paging from the start crosses the evicted part of the ring buffer.
    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let page = orch.get_run_events(&run_id, cursor, 7).unwrap();
        if page.events.is_empty() {
            assert_eq!(page.next_seq, cursor);
            break;
        }
        assert!(page.events.iter().all(|e| e.seq > cursor));
        seen.extend(page.events.iter().map(|e| e.seq));
        cursor = page.next_seq;
    }
    assert!(seen.len() > 16);
    let expected: Vec<u64> = (1..=seen.len() as u64).collect();
    assert_eq!(seen, expected);

    let k = seen.len() as u64 - 5;
    let first = orch.get_run_events(&run_id, k, 100).unwrap();
    let second = orch.get_run_events(&run_id, k, 100).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.events.len(), 5);
}

#[tokio::test]
async fn out_of_band_signal_reaches_the_next_node() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(AtomicBool::new(false));
    let (notify, gate) = (Arc::clone(&started), Arc::clone(&release));
    let mut registry = StepRegistry::new();
    registry
        .register(RegisteredStep::new(
            "wait",
            step_fn(move |_ctx, _state| {
                let (notify, gate) = (Arc::clone(&notify), Arc::clone(&gate));
                async move {
                    notify.notify_one();
                    while !gate.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(StepOutcome::Update(json!({})))
                }
            }),
        ))
        .register(RegisteredStep::new(
            "read",
            step_fn(|ctx, _state| async move {
                let notes: Vec<Value> = ctx.signals().iter().map(|s| s.data.clone()).collect();
                Ok(StepOutcome::Update(json!({ "notes": notes })))
            }),
        ));
    let orch = Orchestrator::new(registry, EngineConfig::default());
    orch.register_graph(
        GraphBuilder::new("signals")
            .node("wait", "wait")
            .node("read", "read")
            .entry("wait")
            .edge("wait", "read")
            .exit("read"),
    )
    .unwrap();

    let run_id = orch.start_run("signals", json!({}), None).await.unwrap();
    tokio::time::timeout(SETTLE, started.notified()).await.unwrap();
    assert!(orch
        .send_event(&run_id, "note", json!({ "text": "rubric updated" }))
        .await
        .unwrap());
    release.store(true, Ordering::SeqCst);

    let info = orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(info.status, "COMPLETED");
    assert_eq!(info.state["notes"], json!([{ "text": "rubric updated" }]));
}

#[tokio::test]
async fn model_usage_and_budgets_show_up_in_metrics() {
    let mut config = EngineConfig::default();
    config.budget.cost_usd = Some(0.10);
    let mut registry = StepRegistry::new();
    registry.register(RegisteredStep::new(
        "grade",
        step_fn(|ctx, _state| async move {
            ctx.emit_stream_chunk("thinking");
            ctx.emit_stream_chunk("scored");
            ctx.record_model_usage("grader-large", 1200, 300, 0.25);
            Ok(StepOutcome::Update(json!({ "score": 7 })))
        }),
    ));
    let orch = Orchestrator::new(registry, config);
    orch.register_graph(GraphBuilder::new("grade").node("grade", "grade").entry("grade").exit("grade"))
        .unwrap();

    let mut live = orch.subscribe_events();
    let run_id = orch.start_run("grade", json!({}), None).await.unwrap();
    orch.wait_until_settled(&run_id, SETTLE).await.unwrap();
    let mut streamed = Vec::new();
    while let Ok(event) = live.try_recv() {
        streamed.push(event.kind);
    }
    assert_eq!(streamed.first(), Some(&EventKind::RunCreated));
    assert_eq!(streamed.last(), Some(&EventKind::RunCompleted));
    assert_eq!(streamed.iter().filter(|k| **k == EventKind::StreamChunk).count(), 2);

    let metrics = orch.get_run_metrics(&run_id).unwrap();
    assert_eq!(metrics.stream_chunks, 2);
    assert_eq!(metrics.usage.prompt_tokens, 1200);
    assert_eq!(metrics.usage.completion_tokens, 300);
    assert_eq!(metrics.usage.total_tokens, 1500);
    assert!((metrics.usage.cost_usd - 0.25).abs() < 1e-9);
    assert!(metrics.usage.by_model.contains_key("grader-large"));
    assert!(metrics.budget.cost_exceeded);
    assert!(!metrics.budget.time_exceeded);
    assert_eq!(metrics.state, "COMPLETED");
}
