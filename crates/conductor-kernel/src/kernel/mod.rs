//! Kernel primitives: identity, events, run state machine, steps, retry, checkpoints.

pub mod artifact;
pub mod checkpoint;
pub mod event;
pub mod identity;
pub mod interrupt;
pub mod registry;
pub mod retry;
pub mod slim;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod state_machine;
pub mod step;

pub use artifact::{Artifact, ArtifactRef, ArtifactStore, InMemoryArtifactStore};
pub use checkpoint::{CheckpointSnapshot, CheckpointStore, InMemoryCheckpointStore};
pub use event::{EventDraft, EventEmitter, EventKind, KernelError, RunEvent};
pub use identity::{AttemptId, NodeId, RunId, Seq};
pub use interrupt::{InterruptId, InterruptKind, PendingInterrupt, Signal};
pub use registry::{RegisteredStep, StepRegistry};
pub use retry::{
    FailureRecord, NoopRetryObserver, RetryDecision, RetryExecutor, RetryObserver, RetryPolicy,
    StepFailure, StepRun,
};
pub use slim::{
    extract_artifact_refs, rehydrate, sha256_hex, slim, slim_for_checkpoint, slim_with_artifacts,
    SlimConfig, Slimmed,
};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteCheckpointStore;
pub use state_machine::{check_transition, classify_failure, FailureClass, RunState, TransitionOutcome};
pub use step::{
    interrupt, step_fn, CallGate, CallPermit, CancellationFlag, Fallback, FlagForReview, FnStep,
    NoopEventEmitter, Step, StepContext, StepError, StepOutcome, UnboundedCallGate,
};
