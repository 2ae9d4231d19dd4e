//! Concurrency controller: global active runs, per-run external calls and per-submitter
//! active runs, each enforced through a shared counting store.
//!
//! Reservations carry an expiry like a worker lease: holders heartbeat to extend them, and
//! counts are always read after pruning expired reservations, so a crashed worker cannot
//! hold a slot forever. Active slots and call permits heartbeat from a background task for
//! as long as they are held, so a node or call outliving the TTL keeps its slot.
//! Queue and active sizes are exposed for upstream backpressure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use conductor_kernel::{CallGate, CallPermit, CancellationFlag, KernelError, RunId};

use crate::config::ConcurrencyConfig;

pub const QUEUED_SCOPE: &str = "queued";
pub const ACTIVE_SCOPE: &str = "active";

/// How long a waiter sleeps before re-checking when nobody signals a release.
const WAIT_POLL: StdDuration = StdDuration::from_millis(250);

const MIN_HEARTBEAT: StdDuration = StdDuration::from_millis(10);

pub fn submitter_scope(submitter: &str) -> String {
    format!("submitter:{submitter}")
}

pub fn calls_scope(run_id: &str) -> String {
    format!("calls:{run_id}")
}

/// Reason for rejecting an admission.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub enum RejectionReason {
    /// Worker or capacity limit; optional description of the limit.
    CapacityLimit(Option<String>),
}

impl RejectionReason {
    pub fn capacity_limit(description: impl Into<String>) -> Self {
        RejectionReason::CapacityLimit(Some(description.into()))
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::CapacityLimit(Some(d)) => write!(f, "capacity limit: {d}"),
            RejectionReason::CapacityLimit(None) => f.write_str("capacity limit"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission rejected: {0}")]
    Rejected(RejectionReason),
    #[error(transparent)]
    Store(#[from] KernelError),
}

/// One slot request inside an all-or-nothing reservation.
#[derive(Clone, Debug)]
pub struct ScopeLimit {
    pub scope: String,
    pub limit: usize,
}

/// Shared counting store with expiring reservations keyed by scope and holder.
pub trait CountingStore: Send + Sync {
    /// Reserves a slot in every scope or in none. Re-reserving an already held slot refreshes it.
    fn try_reserve_all(
        &self,
        holder: &str,
        scopes: &[ScopeLimit],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError>;

    fn release(&self, scope: &str, holder: &str) -> Result<bool, KernelError>;

    /// Extends a held reservation; false when it no longer exists.
    fn heartbeat(
        &self,
        scope: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError>;

    /// True while `holder` has an unexpired reservation in `scope`.
    fn is_held(&self, scope: &str, holder: &str, now: DateTime<Utc>) -> Result<bool, KernelError>;

    /// Live reservations in `scope` after pruning expired ones.
    fn count(&self, scope: &str, now: DateTime<Utc>) -> Result<usize, KernelError>;

    /// Removes expired reservations in every scope; returns how many were removed.
    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, KernelError>;
}

type Reservations = HashMap<String, HashMap<String, DateTime<Utc>>>;

#[derive(Default)]
pub struct InMemoryCountingStore {
    scopes: Mutex<Reservations>,
}

impl InMemoryCountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Reservations>, KernelError> {
        self.scopes
            .lock()
            .map_err(|e| KernelError::Driver(format!("counting store lock poisoned: {e}")))
    }
}

fn prune_scope(holders: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) -> usize {
    let before = holders.len();
    holders.retain(|_, expires_at| *expires_at > now);
    before - holders.len()
}

impl CountingStore for InMemoryCountingStore {
    fn try_reserve_all(
        &self,
        holder: &str,
        scopes: &[ScopeLimit],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let mut guard = self.guard()?;
        for request in scopes {
            let holders = guard.entry(request.scope.clone()).or_default();
            prune_scope(holders, now);
            if !holders.contains_key(holder) && holders.len() >= request.limit {
                return Ok(false);
            }
        }
        let expires_at = now + ttl;
        for request in scopes {
            guard
                .entry(request.scope.clone())
                .or_default()
                .insert(holder.to_string(), expires_at);
        }
        Ok(true)
    }

    fn release(&self, scope: &str, holder: &str) -> Result<bool, KernelError> {
        let mut guard = self.guard()?;
        Ok(guard
            .get_mut(scope)
            .map(|holders| holders.remove(holder).is_some())
            .unwrap_or(false))
    }

    fn heartbeat(
        &self,
        scope: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let mut guard = self.guard()?;
        match guard.get_mut(scope).and_then(|holders| holders.get_mut(holder)) {
            Some(expires_at) if *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_held(&self, scope: &str, holder: &str, now: DateTime<Utc>) -> Result<bool, KernelError> {
        let guard = self.guard()?;
        Ok(guard
            .get(scope)
            .and_then(|holders| holders.get(holder))
            .is_some_and(|expires_at| *expires_at > now))
    }

    fn count(&self, scope: &str, now: DateTime<Utc>) -> Result<usize, KernelError> {
        let mut guard = self.guard()?;
        Ok(guard
            .get_mut(scope)
            .map(|holders| {
                prune_scope(holders, now);
                holders.len()
            })
            .unwrap_or(0))
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, KernelError> {
        let mut guard = self.guard()?;
        let removed = guard
            .values_mut()
            .map(|holders| prune_scope(holders, now))
            .sum();
        guard.retain(|_, holders| !holders.is_empty());
        Ok(removed)
    }
}

/// Queue/active sizes for upstream backpressure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencySnapshot {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent_runs: usize,
    pub queue_high_watermark: usize,
    pub active_high_watermark: usize,
    pub queue_over_watermark: bool,
    pub active_over_watermark: bool,
}

impl ConcurrencySnapshot {
    /// True when an upstream gateway should start shedding load.
    pub fn backpressure(&self) -> bool {
        self.queue_over_watermark || self.active_over_watermark
    }
}

pub struct ConcurrencyController {
    store: Arc<dyn CountingStore>,
    config: ConcurrencyConfig,
    released: Notify,
}

impl ConcurrencyController {
    pub fn new(store: Arc<dyn CountingStore>, config: ConcurrencyConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            released: Notify::new(),
        })
    }

    pub fn in_memory(config: ConcurrencyConfig) -> Arc<Self> {
        Self::new(Arc::new(InMemoryCountingStore::new()), config)
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_std(self.config.reservation_ttl).unwrap_or_else(|_| Duration::seconds(300))
    }

    fn heartbeat_period(&self) -> StdDuration {
        (self.config.reservation_ttl / 3).max(MIN_HEARTBEAT)
    }

    /// Extends every `(scope, holder)` lease each heartbeat period until the task is aborted.
    fn keep_alive(self: &Arc<Self>, leases: Vec<(String, String)>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.heartbeat_period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ttl = controller.ttl();
                let now = Utc::now();
                for (scope, holder) in &leases {
                    match controller.store.heartbeat(scope, holder, ttl, now) {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(scope = %scope, holder = %holder, "reservation expired before heartbeat"),
                        Err(e) => tracing::warn!(scope = %scope, holder = %holder, error = %e, "reservation heartbeat failed"),
                    }
                }
            }
        })
    }

    fn release_quietly(&self, scope: &str, holder: &str) {
        if let Err(e) = self.store.release(scope, holder) {
            tracing::warn!(scope, holder, error = %e, "failed to release reservation");
        }
        self.released.notify_waiters();
    }

    /// Reserves a queue slot for `run_id`. With `hard_watermark`, a full queue rejects.
    pub fn admit(
        self: &Arc<Self>,
        run_id: &RunId,
        submitter: &str,
    ) -> Result<QueueTicket, AdmissionError> {
        let now = Utc::now();
        let queued = self.store.count(QUEUED_SCOPE, now)?;
        let limit = if self.config.hard_watermark {
            self.config.queue_high_watermark
        } else {
            usize::MAX
        };
        if queued >= self.config.queue_high_watermark {
            tracing::warn!(
                run_id = %run_id,
                queued,
                watermark = self.config.queue_high_watermark,
                hard = self.config.hard_watermark,
                "run queue above high watermark"
            );
        }
        let request = [ScopeLimit {
            scope: QUEUED_SCOPE.to_string(),
            limit,
        }];
        if !self.store.try_reserve_all(run_id, &request, self.ttl(), now)? {
            return Err(AdmissionError::Rejected(RejectionReason::capacity_limit(
                format!("queue high watermark {} reached", self.config.queue_high_watermark),
            )));
        }
        Ok(QueueTicket {
            controller: Arc::clone(self),
            run_id: run_id.clone(),
            submitter: submitter.to_string(),
            active: false,
        })
    }

    pub fn snapshot(&self) -> Result<ConcurrencySnapshot, KernelError> {
        let now = Utc::now();
        let queued = self.store.count(QUEUED_SCOPE, now)?;
        let active = self.store.count(ACTIVE_SCOPE, now)?;
        Ok(ConcurrencySnapshot {
            queued,
            active,
            max_concurrent_runs: self.config.max_concurrent_runs,
            queue_high_watermark: self.config.queue_high_watermark,
            active_high_watermark: self.config.active_high_watermark,
            queue_over_watermark: queued > self.config.queue_high_watermark,
            active_over_watermark: active > self.config.active_high_watermark,
        })
    }

    pub fn submitter_active(&self, submitter: &str) -> Result<usize, KernelError> {
        self.store.count(&submitter_scope(submitter), Utc::now())
    }

    pub fn calls_in_flight(&self, run_id: &str) -> Result<usize, KernelError> {
        self.store.count(&calls_scope(run_id), Utc::now())
    }

    /// True while some worker sharing the counting store holds an active slot for `run_id`.
    pub fn is_active(&self, run_id: &str) -> Result<bool, KernelError> {
        self.store.is_held(ACTIVE_SCOPE, run_id, Utc::now())
    }

    /// Prunes expired reservations and wakes waiters when slots were freed.
    pub fn prune_expired(&self) -> Result<usize, KernelError> {
        let removed = self.store.prune_expired(Utc::now())?;
        if removed > 0 {
            tracing::info!(removed, "pruned expired reservations");
            self.released.notify_waiters();
        }
        Ok(removed)
    }

    /// Call gate bound to this controller's per-run external-call limit.
    pub fn call_gate(self: &Arc<Self>) -> Arc<dyn CallGate> {
        Arc::new(RunCallGate {
            controller: Arc::clone(self),
        })
    }

    async fn wait_for_release(
        &self,
        mut try_once: impl FnMut() -> Result<bool, KernelError> + Send,
    ) -> Result<(), KernelError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if try_once()? {
                return Ok(());
            }
            let _ = tokio::time::timeout(WAIT_POLL, notified).await;
        }
    }
}

/// Queue reservation of an admitted run; released on drop unless activated.
pub struct QueueTicket {
    controller: Arc<ConcurrencyController>,
    run_id: RunId,
    submitter: String,
    active: bool,
}

impl QueueTicket {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Waits for a global and a per-submitter slot, then leaves the queue.
    /// Returns `None` if the run is cancelled while waiting.
    pub async fn activate(
        mut self,
        cancel: &CancellationFlag,
    ) -> Result<Option<ActiveSlot>, KernelError> {
        let controller = Arc::clone(&self.controller);
        let scopes = [
            ScopeLimit {
                scope: ACTIVE_SCOPE.to_string(),
                limit: controller.config.max_concurrent_runs,
            },
            ScopeLimit {
                scope: submitter_scope(&self.submitter),
                limit: controller.config.max_runs_per_submitter,
            },
        ];
        let ttl = controller.ttl();
        let mut cancelled = false;
        let run_id = self.run_id.clone();
        controller
            .wait_for_release(|| {
                if cancel.is_cancelled() {
                    cancelled = true;
                    return Ok(true);
                }
                let now = Utc::now();
                // Keep the queue slot alive while waiting.
                controller.store.heartbeat(QUEUED_SCOPE, &run_id, ttl, now)?;
                controller.store.try_reserve_all(&run_id, &scopes, ttl, now)
            })
            .await?;
        if cancelled {
            return Ok(None);
        }
        self.active = true;
        controller.release_quietly(QUEUED_SCOPE, &self.run_id);
        tracing::debug!(run_id = %self.run_id, submitter = %self.submitter, "run activated");
        let keepalive = controller.keep_alive(vec![
            (ACTIVE_SCOPE.to_string(), self.run_id.clone()),
            (submitter_scope(&self.submitter), self.run_id.clone()),
        ]);
        Ok(Some(ActiveSlot {
            controller,
            run_id: self.run_id.clone(),
            submitter: self.submitter.clone(),
            keepalive,
        }))
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.active {
            self.controller.release_quietly(QUEUED_SCOPE, &self.run_id);
        }
    }
}

/// Active-run reservation (global + submitter), kept alive while held. Released on drop.
pub struct ActiveSlot {
    controller: Arc<ConcurrencyController>,
    run_id: RunId,
    submitter: String,
    keepalive: JoinHandle<()>,
}

impl ActiveSlot {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.controller.release_quietly(ACTIVE_SCOPE, &self.run_id);
        self.controller
            .release_quietly(&submitter_scope(&self.submitter), &self.run_id);
    }
}

struct RunCallGate {
    controller: Arc<ConcurrencyController>,
}

struct CallReservation {
    controller: Arc<ConcurrencyController>,
    scope: String,
    holder: String,
    keepalive: JoinHandle<()>,
}

impl Drop for CallReservation {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.controller.release_quietly(&self.scope, &self.holder);
    }
}

#[async_trait]
impl CallGate for RunCallGate {
    async fn acquire(&self, run_id: &RunId) -> Result<CallPermit, KernelError> {
        let scope = calls_scope(run_id);
        let holder = uuid::Uuid::new_v4().to_string();
        let request = [ScopeLimit {
            scope: scope.clone(),
            limit: self.controller.config.max_calls_per_run,
        }];
        let ttl = self.controller.ttl();
        self.controller
            .wait_for_release(|| {
                self.controller
                    .store
                    .try_reserve_all(&holder, &request, ttl, Utc::now())
            })
            .await?;
        let keepalive = self
            .controller
            .keep_alive(vec![(scope.clone(), holder.clone())]);
        Ok(CallPermit::new(CallReservation {
            controller: Arc::clone(&self.controller),
            scope,
            holder,
            keepalive,
        }))
    }
}
