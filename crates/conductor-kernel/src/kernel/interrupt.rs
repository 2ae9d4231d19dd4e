//! Interrupt: a pause in execution waiting for external input, and the signal that resolves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::identity::NodeId;

/// Unique identifier for an interrupt.
pub type InterruptId = String;

/// Why the run paused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// The step asked for external input (`StepOutcome::Interrupt`).
    Dynamic,
    /// The node is declared `interrupt_before` in the graph.
    Breakpoint,
}

/// Interrupt persisted in the checkpoint until `send_event` resolves it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub interrupt_id: InterruptId,
    pub node: NodeId,
    pub kind: InterruptKind,
    /// Payload shown to the human/external actor.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl PendingInterrupt {
    pub fn new(node: impl Into<NodeId>, kind: InterruptKind, payload: Value) -> Self {
        Self {
            interrupt_id: uuid::Uuid::new_v4().to_string(),
            node: node.into(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// External event delivered to a run: resume data or an out-of-band signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub event_type: String,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            received_at: Utc::now(),
        }
    }
}
