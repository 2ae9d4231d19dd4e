//! Run state machine: legal transitions and failure classification.
//!
//! Transitions are validated against a fixed successor table. An illegal transition is
//! never an error: [check_transition] reports `valid = false` and leaves the state as it was.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Running,
    Retrying,
    /// A batch run produced a usable partial result despite sub-item failures.
    PartialFailed,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 7] = [
        RunState::Created,
        RunState::Running,
        RunState::Retrying,
        RunState::PartialFailed,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Allowed successor states (self-loops are handled separately).
    pub fn successors(&self) -> &'static [RunState] {
        match self {
            RunState::Created => &[RunState::Running, RunState::Failed, RunState::Cancelled],
            RunState::Running => &[
                RunState::Retrying,
                RunState::PartialFailed,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ],
            RunState::Retrying => &[
                RunState::Running,
                RunState::PartialFailed,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ],
            RunState::PartialFailed => &[
                RunState::Retrying,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ],
            RunState::Completed | RunState::Failed | RunState::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        *self == next || self.successors().contains(&next)
    }

    /// Status string kept for callers that predate the richer state set.
    pub fn legacy_status(&self) -> &'static str {
        match self {
            RunState::Created => "pending",
            RunState::Running | RunState::Retrying => "running",
            RunState::PartialFailed => "partial",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::Running => "RUNNING",
            RunState::Retrying => "RETRYING",
            RunState::PartialFailed => "PARTIAL_FAILED",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<RunState> {
        RunState::ALL.iter().copied().find(|state| state.as_str() == s)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a transition request. `current == previous` whenever `valid` is false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub previous: RunState,
    pub current: RunState,
    pub valid: bool,
}

impl TransitionOutcome {
    /// True when the transition was accepted and actually changed the state.
    pub fn changed(&self) -> bool {
        self.valid && self.previous != self.current
    }
}

/// Validates `current -> next` against the successor table.
pub fn check_transition(current: RunState, next: RunState) -> TransitionOutcome {
    if current.can_transition_to(next) {
        TransitionOutcome {
            previous: current,
            current: next,
            valid: true,
        }
    } else {
        TransitionOutcome {
            previous: current,
            current,
            valid: false,
        }
    }
}

/// Classification of a step failure; drives retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Retryable,
    NonRetryable,
    HumanReviewRequired,
    UserCancelled,
    Unknown,
}

const CANCELLATION_PHRASES: &[&str] = &["cancelled", "canceled", "user cancel", "aborted by user"];
const RETRYABLE_PHRASES: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "429",
    "timeout",
    "timed out",
    "deadline exceeded",
    "temporarily unavailable",
    "503",
    "connection reset",
];
const REVIEW_PHRASES: &[&str] = &[
    "human review",
    "review required",
    "needs review",
    "manual review",
];
const NON_RETRYABLE_PHRASES: &[&str] = &[
    "validation",
    "invalid",
    "permission denied",
    "forbidden",
    "unauthorized",
    "not allowed",
    "401",
    "403",
];

/// Classifies free-form error text with ordered keyword rules (first match wins).
pub fn classify_failure(text: &str) -> FailureClass {
    let lowered = text.to_ascii_lowercase();
    let rules: [(&[&str], FailureClass); 4] = [
        (CANCELLATION_PHRASES, FailureClass::UserCancelled),
        (RETRYABLE_PHRASES, FailureClass::Retryable),
        (REVIEW_PHRASES, FailureClass::HumanReviewRequired),
        (NON_RETRYABLE_PHRASES, FailureClass::NonRetryable),
    ];
    for (phrases, class) in rules {
        if phrases.iter().any(|p| lowered.contains(p)) {
            return class;
        }
    }
    FailureClass::Unknown
}
