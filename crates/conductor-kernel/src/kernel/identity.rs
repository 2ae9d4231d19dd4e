//! Run identity types for the conductor kernel.
//!
//! RunId identifies one execution of a workflow graph; AttemptId identifies one
//! (re)start of that execution; Seq is the monotonically increasing event sequence per run.

/// Identifies one run (idempotency key or generated id).
pub type RunId = String;

/// Identifies one execution attempt of a run.
pub type AttemptId = String;

/// Graph node name.
pub type NodeId = String;

/// Monotonically increasing sequence number per run (events and checkpoints).
pub type Seq = u64;
