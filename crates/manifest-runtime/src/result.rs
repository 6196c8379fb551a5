//! Command invocation inputs and outcomes.
//!
//! Business-rule failures are data, never errors: a blocked command
//! still returns a `CommandResult` so callers can show every applicable
//! warning next to the blocking reason without fault-handling machinery.

use manifest_causality::VectorClock;
use manifest_lang::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Owning entity; required only when command names collide.
    #[serde(default, rename = "entityName", skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(rename = "commandName")]
    pub command: String,
    pub payload: Value,
    /// Actor committing the change; drives the vector clock.
    pub actor: String,
    pub aggregate_id: String,
}

/// Aggregate state as read inside the caller's transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub state: Value,
    /// Last event sequence number committed for this aggregate.
    pub last_seq: u64,
    pub clock: VectorClock,
}

impl AggregateSnapshot {
    pub fn new(state: Value) -> Self {
        AggregateSnapshot {
            state,
            last_seq: 0,
            clock: VectorClock::new(),
        }
    }
}

/// Result of one rule check. Recorded only when the rule is violated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintOutcome {
    #[serde(rename = "ruleId")]
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// First `self.<field>` the rule references, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// A domain fact produced by a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    /// Per-aggregate sequence number, monotonic from the snapshot's
    /// `last_seq`.
    pub seq: u64,
}

/// Outcome of one command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// True iff no outcome has `block` or `fatal` severity.
    pub success: bool,
    pub outcomes: Vec<ConstraintOutcome>,
    pub events: Vec<EmittedEvent>,
}

impl CommandResult {
    /// Worst severity among recorded outcomes.
    pub fn max_severity(&self) -> Option<Severity> {
        self.outcomes.iter().map(|o| o.severity).max()
    }
}

/// Completed execution: the result plus everything the caller needs to
/// commit: new state, moved clock, and final sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub entity: String,
    pub result: CommandResult,
    /// Snapshot state with the command's changes applied; identical to
    /// the input state on failure.
    pub new_state: Value,
    /// Clock after the local commit; the input clock on failure.
    pub clock: VectorClock,
    /// Highest sequence number assigned; the input value on failure.
    pub last_seq: u64,
}

/// Engine verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Execution {
    /// The command/entity pair did not resolve. A value, not an error,
    /// mapped to a 404-equivalent by the response layer.
    NotFound {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        message: String,
    },
    Completed(CommandOutcome),
}

impl Execution {
    pub fn completed(&self) -> Option<&CommandOutcome> {
        match self {
            Execution::Completed(outcome) => Some(outcome),
            Execution::NotFound { .. } => None,
        }
    }
}
