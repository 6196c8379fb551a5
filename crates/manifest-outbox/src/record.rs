//! Outbox rows, envelopes, and the transactional unit of work.

use chrono::{DateTime, Utc};
use manifest_causality::VectorClock;
use manifest_runtime::{CommandOutcome, CommandRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique outbox record id (UUID string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxId(pub String);

impl OutboxId {
    pub fn new() -> Self {
        OutboxId(Uuid::new_v4().to_string())
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery status of an outbox record.
///
/// Transitions are monotonic: `pending → publishing → published`, with
/// `publishing → pending` (retry or claim-timeout requeue) and
/// `publishing → dead` (retries exhausted, oversized payload) as the
/// only other legal moves. A published row never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<OutboxStatus> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "publishing" => Some(OutboxStatus::Publishing),
            "published" => Some(OutboxStatus::Published),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

/// Durable, delivery-pending domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    /// Per-aggregate sequence number assigned at execution time.
    pub seq: u64,
    /// Clock at commit time; travels in the envelope for downstream
    /// causal comparison.
    pub clock: VectorClock,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a pending row for one emitted event.
    pub fn pending(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        seq: u64,
        clock: VectorClock,
    ) -> Self {
        OutboxRecord {
            id: OutboxId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            seq,
            clock,
            status: OutboxStatus::Pending,
            attempts: 0,
            claimed_by: None,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
            published_at: None,
            next_attempt_at: None,
        }
    }

    /// Envelope published to the realtime channel.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: self.payload.clone(),
            seq: self.seq,
            vector_clock: self.clock.clone(),
        }
    }
}

/// Wire format crossing the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub seq: u64,
    pub vector_clock: VectorClock,
}

/// Aggregate row as persisted next to its outbox events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRow {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub state: Value,
    pub last_seq: u64,
    pub clock: VectorClock,
    pub updated_at: DateTime<Utc>,
}

/// Atomic unit of work: one aggregate mutation plus its outbox inserts.
///
/// This coupling is the outbox pattern's correctness property: an
/// event row is durable iff the state change it describes committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTransaction {
    pub aggregate: AggregateRow,
    pub events: Vec<OutboxRecord>,
}

impl CommandTransaction {
    /// Stage a transaction from a successful execution.
    ///
    /// Returns `None` for failed results: nothing is persisted for a
    /// blocked command, so no outbox row can exist for a state change
    /// that never happened.
    pub fn stage(
        aggregate_type: &str,
        request: &CommandRequest,
        outcome: &CommandOutcome,
    ) -> Option<Self> {
        if !outcome.result.success {
            return None;
        }

        let aggregate = AggregateRow {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: request.aggregate_id.clone(),
            state: outcome.new_state.clone(),
            last_seq: outcome.last_seq,
            clock: outcome.clock.clone(),
            updated_at: Utc::now(),
        };

        let events = outcome
            .result
            .events
            .iter()
            .map(|event| {
                OutboxRecord::pending(
                    aggregate_type,
                    event.aggregate_id.clone(),
                    event.event_type.clone(),
                    event.payload.clone(),
                    event.seq,
                    outcome.clock.clone(),
                )
            })
            .collect();

        Some(CommandTransaction { aggregate, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest_runtime::{CommandResult, EmittedEvent};
    use serde_json::json;

    fn request() -> CommandRequest {
        CommandRequest {
            entity: None,
            command: "claim".to_string(),
            payload: json!({ "employeeId": "emp-7" }),
            actor: "actor-a".to_string(),
            aggregate_id: "task-1".to_string(),
        }
    }

    fn outcome(success: bool) -> CommandOutcome {
        let mut clock = VectorClock::new();
        clock.increment("actor-a");
        CommandOutcome {
            entity: "PrepTask".to_string(),
            result: CommandResult {
                success,
                outcomes: vec![],
                events: if success {
                    vec![EmittedEvent {
                        event_type: "kitchen.task.claimed".to_string(),
                        aggregate_id: "task-1".to_string(),
                        payload: json!({ "employeeId": "emp-7" }),
                        seq: 1,
                    }]
                } else {
                    vec![]
                },
            },
            new_state: json!({ "claimedBy": "emp-7" }),
            clock,
            last_seq: 1,
        }
    }

    #[test]
    fn test_stage_builds_one_pending_row_per_event() {
        let txn = CommandTransaction::stage("PrepTask", &request(), &outcome(true))
            .expect("staged");
        assert_eq!(txn.events.len(), 1);
        let row = &txn.events[0];
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.aggregate_type, "PrepTask");
        assert_eq!(row.seq, 1);
        assert_eq!(row.clock.get("actor-a"), 1);
        assert_eq!(txn.aggregate.last_seq, 1);
    }

    #[test]
    fn test_stage_refuses_failed_results() {
        assert!(CommandTransaction::stage("PrepTask", &request(), &outcome(false)).is_none());
    }

    #[test]
    fn test_envelope_carries_clock_and_seq() {
        let txn = CommandTransaction::stage("PrepTask", &request(), &outcome(true))
            .expect("staged");
        let envelope = txn.events[0].envelope();
        assert_eq!(envelope.event_type, "kitchen.task.claimed");
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.vector_clock.get("actor-a"), 1);

        let json = serde_json::to_value(&envelope).expect("serialize");
        assert!(json.get("vectorClock").is_some());
        assert!(json.get("aggregateId").is_some());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Publishing,
            OutboxStatus::Published,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("limbo"), None);
    }
}
