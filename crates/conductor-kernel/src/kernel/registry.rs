//! Step registry: step name to invocable capability, with its retry policy and fallback.
//!
//! Graphs are compiled against a registry; nodes hold the resolved `Arc<dyn Step>`, so
//! nothing is looked up by name while a run executes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::kernel::retry::RetryPolicy;
use crate::kernel::step::{Fallback, Step};

/// A step plus the rules the retry executor applies to it.
#[derive(Clone)]
pub struct RegisteredStep {
    pub name: String,
    pub step: Arc<dyn Step>,
    pub retry: RetryPolicy,
    pub fallback: Option<Arc<dyn Fallback>>,
}

impl RegisteredStep {
    pub fn new(name: impl Into<String>, step: impl Step + 'static) -> Self {
        Self {
            name: name.into(),
            step: Arc::new(step),
            retry: RetryPolicy::default(),
            fallback: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Fallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

impl std::fmt::Debug for RegisteredStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStep")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Explicit registry built at startup and shared by `Arc`.
#[derive(Clone, Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, RegisteredStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a step under its name.
    pub fn register(&mut self, step: RegisteredStep) -> &mut Self {
        if self.steps.contains_key(&step.name) {
            tracing::debug!(step = %step.name, "replacing registered step");
        }
        self.steps.insert(step.name.clone(), step);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredStep> {
        self.steps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kernel::step::{step_fn, FlagForReview, StepContext, StepOutcome};

    #[tokio::test]
    async fn registered_step_is_invocable_by_name() {
        let mut registry = StepRegistry::new();
        registry
            .register(RegisteredStep::new(
                "extract",
                step_fn(|_ctx, _state| async { Ok(StepOutcome::Update(json!({ "pages": 3 }))) }),
            ))
            .register(
                RegisteredStep::new(
                    "score",
                    step_fn(|_ctx, _state| async { Ok(StepOutcome::Update(json!({}))) }),
                )
                .with_fallback(FlagForReview),
            );

        assert_eq!(registry.names(), vec!["extract", "score"]);
        assert!(registry.get("score").unwrap().fallback.is_some());
        assert!(registry.get("missing").is_none());

        let step = registry.get("extract").unwrap();
        let out = step
            .step
            .run(&StepContext::detached("r", "extract"), &json!({}))
            .await
            .unwrap();
        assert_eq!(out, StepOutcome::Update(json!({ "pages": 3 })));
    }
}
