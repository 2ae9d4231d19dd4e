//! Conductor kernel: the leaf primitives of the run-orchestration engine.
//!
//! Everything above this crate (graph executor, concurrency control, observability,
//! orchestrator facade) lives in `conductor-runtime`.

pub mod kernel;

pub use kernel::*;
