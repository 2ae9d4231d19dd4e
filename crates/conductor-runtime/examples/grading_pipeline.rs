//! Grades a scanned exam: per-page extraction (cached, fanned out), model scoring, a human
//! approval interrupt, then publishing.
//!
//! ```text
//! RUST_LOG=info,conductor_runtime=debug cargo run -p conductor-runtime --example grading_pipeline
//! CONDUCTOR_STORAGE_BACKEND=sqlite CONDUCTOR_SQLITE_DB=grading.db cargo run ...
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use conductor_kernel::{
    interrupt, step_fn, FlagForReview, RegisteredStep, RetryPolicy, StepError, StepOutcome,
    StepRegistry,
};
use conductor_runtime::{
    cache_key, EngineConfig, GraphBuilder, InMemorySharedTier, InvalidationBus, Orchestrator,
    RecoveryConfig, RecoverySupervisor, TieredCache, PAUSED,
};

const OCR_POLICY: &str = "ocr-v3";

fn registry(cache: Arc<TieredCache>) -> StepRegistry {
    let extract = step_fn(move |ctx, state| {
        let cache = Arc::clone(&cache);
        async move {
            let pages: Vec<String> = state["pages"]
                .as_array()
                .map(|p| p.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let results = ctx
                .fan_out(pages, move |page| {
                    let cache = Arc::clone(&cache);
                    async move {
                        let key = cache_key(page.as_bytes(), OCR_POLICY, &json!({ "lang": "en" }));
                        cache
                            .get_or_compute(&key, &["ocr"], || async {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok::<Value, StepError>(json!(format!("text of {page}")))
                            })
                            .await
                    }
                })
                .await;
            let mut texts = Vec::new();
            let mut failures = Vec::new();
            for (idx, result) in results.into_iter().enumerate() {
                match result {
                    Ok(text) => texts.push(text),
                    Err(e) => failures.push(format!("page {idx}: {e}")),
                }
            }
            let update = json!({ "texts": texts });
            if failures.is_empty() {
                Ok(StepOutcome::Update(update))
            } else {
                Ok(StepOutcome::Partial { update, failures })
            }
        }
    });

    let score = step_fn(|ctx, state| async move {
        let pages = state["texts"].as_array().map(|t| t.len()).unwrap_or(0) as u64;
        ctx.emit_stream_chunk("reading answers");
        ctx.record_model_usage("grader-large", 800 * pages, 120 * pages, 0.004 * pages as f64);
        ctx.emit_stream_chunk("scored");
        Ok(StepOutcome::Update(json!({ "score": 17, "max_score": 20 })))
    });

    let approval = step_fn(|ctx, state| async move {
        match ctx.resume_value() {
            Some(decision) => Ok(StepOutcome::Update(json!({
                "approved_by": decision["reviewer"],
                "final_score": decision.get("score").cloned().unwrap_or(state["score"].clone()),
            }))),
            None => Ok(interrupt(json!({
                "question": "confirm the proposed score",
                "score": state["score"],
            }))),
        }
    });

    let publish = step_fn(|ctx, state| async move {
        ctx.external_call(async { Ok(()) }).await?;
        Ok(StepOutcome::Update(json!({ "published": state["final_score"] })))
    });

    let mut registry = StepRegistry::new();
    registry
        .register(RegisteredStep::new("extract", extract))
        .register(
            RegisteredStep::new("score", score)
                .with_retry(RetryPolicy::new(Duration::from_millis(200), 2.0, Duration::from_secs(2), 3))
                .with_fallback(FlagForReview),
        )
        .register(RegisteredStep::new("approval", approval))
        .register(RegisteredStep::new("publish", publish));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,conductor_runtime=info,grading_pipeline=info")
        }))
        .init();

    let config = EngineConfig::from_env()?;
    let cache = Arc::new(TieredCache::new(
        Arc::new(InMemorySharedTier::new()),
        Arc::new(InvalidationBus::default()),
        config.cache.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::from_config(registry(Arc::clone(&cache)), config)?);
    orchestrator.register_graph(
        GraphBuilder::new("grading")
            .node("extract", "extract")
            .node("score", "score")
            .node("approval", "approval")
            .node("publish", "publish")
            .entry("extract")
            .edge("extract", "score")
            .edge("score", "approval")
            .edge("approval", "publish")
            .exit("publish"),
    )?;
    let supervisor = RecoverySupervisor::start(Arc::clone(&orchestrator), RecoveryConfig::default());

    let exam = json!({ "student": "s-1042", "pages": ["scan-1", "scan-2", "scan-3"] });
    for attempt in 0..2 {
        let run_id = orchestrator
            .start_run_as("course-cs101", "grading", exam.clone(), None)
            .await?;
        let info = orchestrator
            .wait_until_settled(&run_id, Duration::from_secs(10))
            .await?;
        if info.status != PAUSED {
            bail!("run {run_id} did not pause for approval: {}", info.status);
        }
        for pending in orchestrator.list_pending_interrupts()? {
            tracing::info!(run_id = %pending.run_id, payload = %pending.interrupt.payload, "awaiting approval");
        }

        orchestrator
            .send_event(&run_id, "approve", json!({ "reviewer": "ms-okafor" }))
            .await?;
        let done = orchestrator
            .wait_until_settled(&run_id, Duration::from_secs(10))
            .await?;
        let metrics = orchestrator.get_run_metrics(&run_id)?;
        tracing::info!(
            attempt,
            run_id = %run_id,
            status = %done.status,
            published = %done.state["published"],
            tokens = metrics.usage.total_tokens,
            cost_usd = metrics.usage.cost_usd,
            retry_rate = metrics.quality.retry_rate,
            "grading run finished"
        );
    }

    // The second run found every page in the cache.
    let stats = cache.stats();
    tracing::info!(local_hits = stats.local_hits, shared_hits = stats.shared_hits, misses = stats.misses, "ocr cache");
    cache.invalidate_tag("ocr").await?;

    let ticks = supervisor.shutdown().await;
    tracing::info!(ticks, "done");
    Ok(())
}
