//! Conductor runtime: workflow graphs and their executor, admission and concurrency control,
//! run observability, the multi-layer cache, persistence and the orchestrator facade.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod executor;
pub mod graph;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod recovery;
pub mod repository;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_counting;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_repository;

pub use cache::{
    cache_key, CacheEntry, CacheStats, InMemorySharedTier, Invalidation, InvalidationBus,
    SharedTier, TieredCache,
};
pub use concurrency::{
    ActiveSlot, AdmissionError, ConcurrencyController, ConcurrencySnapshot, CountingStore,
    InMemoryCountingStore, QueueTicket, RejectionReason, ScopeLimit, ACTIVE_SCOPE, QUEUED_SCOPE,
};
pub use config::{
    BudgetConfig, CacheConfig, ConcurrencyConfig, ConfigError, EngineConfig, StorageBackend,
};
pub use executor::{DriverClaim, DriverSet, ExecutorStores, GraphExecutor, RunEventSink};
pub use graph::{CompiledGraph, EdgePredicate, GraphBuilder, GraphError, Route};
pub use models::{
    AttemptRecord, AttemptState, EventPage, PausedRun, RunFilter, RunInfo, RunProgress, RunRecord,
    PAUSED,
};
pub use observability::{
    BudgetReport, ModelUsage, QualitySignals, RunMetrics, RunObservabilityStore, UsageTotals,
};
pub use orchestrator::{
    Orchestrator, OrchestratorError, RecoveryReport, CANCEL_EVENT, DEFAULT_SUBMITTER,
};
pub use recovery::{RecoveryConfig, RecoverySupervisor};
pub use repository::{InMemoryRunRepository, RunRepository};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_counting::SqliteCountingStore;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteRunRepository;
