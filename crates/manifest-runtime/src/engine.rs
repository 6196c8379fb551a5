//! Command execution against compiled IR.

use std::sync::Arc;

use manifest_lang::ast::Expr;
use manifest_lang::{CommandLookup, Ir, IrCommand};
use serde_json::{Map, Value};
use tracing::debug;

use crate::eval::{evaluate, EvalContext};
use crate::result::{
    AggregateSnapshot, CommandOutcome, CommandRequest, CommandResult, ConstraintOutcome,
    EmittedEvent, Execution,
};

/// Executes named commands against aggregate snapshots.
///
/// The engine holds nothing but the immutable IR, passed in explicitly
/// so several IR versions can coexist in one process (blue/green schema
/// rollout). Every invocation works on the snapshot the caller passes,
/// so executions are reentrant and may run concurrently across threads
/// without coordination.
#[derive(Debug, Clone)]
pub struct RuntimeEngine {
    ir: Arc<Ir>,
}

impl RuntimeEngine {
    pub fn new(ir: Arc<Ir>) -> Self {
        RuntimeEngine { ir }
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    /// Execute one command.
    ///
    /// Constraints run in declaration order and every one is evaluated:
    /// advisory severities never short-circuit, and a `block`/`fatal`
    /// outcome still lets the remaining rules report, so the caller sees
    /// all applicable warnings beside the blocking reason. Events and
    /// state changes materialize only on success.
    pub fn execute(&self, request: &CommandRequest, snapshot: &AggregateSnapshot) -> Execution {
        let command = match self.ir.resolve(&request.command, request.entity.as_deref()) {
            CommandLookup::Found(command) => command,
            CommandLookup::NotFound => {
                return Execution::NotFound {
                    command: request.command.clone(),
                    entity: request.entity.clone(),
                    message: format!("command '{}' not found", request.command),
                }
            }
            CommandLookup::UnknownEntity => {
                return Execution::NotFound {
                    command: request.command.clone(),
                    entity: request.entity.clone(),
                    message: format!(
                        "entity '{}' not found",
                        request.entity.as_deref().unwrap_or_default()
                    ),
                }
            }
            CommandLookup::Ambiguous(owners) => {
                return Execution::NotFound {
                    command: request.command.clone(),
                    entity: request.entity.clone(),
                    message: format!(
                        "command '{}' is owned by multiple entities ({}); pass an entity name",
                        request.command,
                        owners.join(", ")
                    ),
                }
            }
        };

        self.run(command, request, snapshot)
    }

    fn run(
        &self,
        command: &IrCommand,
        request: &CommandRequest,
        snapshot: &AggregateSnapshot,
    ) -> Execution {
        let ctx = EvalContext {
            state: &snapshot.state,
            payload: &request.payload,
        };

        let mut outcomes = Vec::new();
        for constraint in &command.constraints {
            let value = evaluate(&constraint.expr, &ctx);
            if !matches!(value, Value::Bool(true)) {
                outcomes.push(ConstraintOutcome {
                    rule: constraint.rule.clone(),
                    severity: constraint.severity,
                    message: constraint.message.clone().unwrap_or_else(|| {
                        format!("constraint '{}' violated", constraint.rule)
                    }),
                    field: primary_field(&constraint.expr),
                });
            }
        }

        let success = !outcomes.iter().any(|o| o.severity.blocks());
        if !success {
            debug!(
                command = %command.name,
                entity = %command.entity,
                outcomes = outcomes.len(),
                "command blocked"
            );
            return Execution::Completed(CommandOutcome {
                entity: command.entity.clone(),
                result: CommandResult {
                    success: false,
                    outcomes,
                    events: Vec::new(),
                },
                new_state: snapshot.state.clone(),
                clock: snapshot.clock.clone(),
                last_seq: snapshot.last_seq,
            });
        }

        let new_state = self.merge_state(command, &snapshot.state, &request.payload);
        let mut clock = snapshot.clock.clone();
        clock.increment(&request.actor);

        let mut seq = snapshot.last_seq;
        let events: Vec<EmittedEvent> = command
            .events
            .iter()
            .map(|template| {
                seq += 1;
                EmittedEvent {
                    event_type: template.event_type.clone(),
                    aggregate_id: request.aggregate_id.clone(),
                    payload: request.payload.clone(),
                    seq,
                }
            })
            .collect();

        debug!(
            command = %command.name,
            entity = %command.entity,
            events = events.len(),
            "command succeeded"
        );
        Execution::Completed(CommandOutcome {
            entity: command.entity.clone(),
            result: CommandResult {
                success: true,
                outcomes,
                events,
            },
            new_state,
            clock,
            last_seq: seq,
        })
    }

    /// Merge payload fields that name declared properties into the
    /// state. Unknown payload keys are ignored.
    fn merge_state(&self, command: &IrCommand, state: &Value, payload: &Value) -> Value {
        let mut merged = match state {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let (Some(entity), Value::Object(payload)) =
            (self.ir.entities.get(&command.entity), payload)
        {
            for property in &entity.properties {
                if let Some(value) = payload.get(&property.name) {
                    merged.insert(property.name.clone(), value.clone());
                }
            }
        }
        Value::Object(merged)
    }
}

/// First `self.<field>` path mentioned by the expression.
fn primary_field(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Member { object, property } => {
            if matches!(object.as_ref(), Expr::Ident { name } if name == "self") {
                Some(property.clone())
            } else {
                primary_field(object)
            }
        }
        Expr::Unary { operand, .. } => primary_field(operand),
        Expr::Binary { left, right, .. } => primary_field(left).or_else(|| primary_field(right)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest_lang::{compile, Severity};
    use serde_json::json;

    const MANIFEST: &str = r#"
        entity PrepTask {
          property required id: string
          property status: string = "open"
          property claimedBy: string = ""
          property quantity: number = 0

          command claim(employeeId: string) {
            constraint notClaimed:block self.claimedBy == "" "Task is already claimed"
            constraint hasQuantity:warn self.quantity > 0 "Task has no quantity set"
            emit kitchen.task.claimed
          }

          command cancel() {
            constraint notStarted:fatal self.status == "open" "Only open tasks can be cancelled"
            emit kitchen.task.cancelled
          }
        }

        entity Menu {
          command archive() {
            emit menu.archived
          }
        }

        entity Recipe {
          command archive() {
            emit recipe.archived
          }
        }
    "#;

    fn engine() -> RuntimeEngine {
        let ir = compile(MANIFEST).ir.expect("ir");
        RuntimeEngine::new(Arc::new(ir))
    }

    fn request(command: &str, entity: Option<&str>, payload: Value) -> CommandRequest {
        CommandRequest {
            entity: entity.map(str::to_string),
            command: command.to_string(),
            payload,
            actor: "actor-a".to_string(),
            aggregate_id: "task-1".to_string(),
        }
    }

    #[test]
    fn test_successful_command_emits_events_and_moves_clock() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "open", "claimedBy": "", "quantity": 4
        }));
        let execution = engine.execute(
            &request("claim", None, json!({ "employeeId": "emp-7" })),
            &snapshot,
        );

        let outcome = execution.completed().expect("completed");
        assert!(outcome.result.success);
        assert!(outcome.result.outcomes.is_empty());
        assert_eq!(outcome.result.events.len(), 1);
        assert_eq!(outcome.result.events[0].event_type, "kitchen.task.claimed");
        assert_eq!(outcome.result.events[0].seq, 1);
        assert_eq!(outcome.last_seq, 1);
        assert_eq!(outcome.clock.get("actor-a"), 1);
    }

    #[test]
    fn test_sequence_continues_from_snapshot() {
        let engine = engine();
        let mut snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "open", "claimedBy": "", "quantity": 4
        }));
        snapshot.last_seq = 41;
        let execution = engine.execute(
            &request("claim", None, json!({ "employeeId": "emp-7" })),
            &snapshot,
        );
        let outcome = execution.completed().expect("completed");
        assert_eq!(outcome.result.events[0].seq, 42);
        assert_eq!(outcome.last_seq, 42);
    }

    #[test]
    fn test_warn_only_still_succeeds() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "open", "claimedBy": "", "quantity": 0
        }));
        let execution = engine.execute(
            &request("claim", None, json!({ "employeeId": "emp-7" })),
            &snapshot,
        );

        let outcome = execution.completed().expect("completed");
        assert!(outcome.result.success);
        assert_eq!(outcome.result.outcomes.len(), 1);
        assert_eq!(outcome.result.outcomes[0].severity, Severity::Warn);
        assert_eq!(outcome.result.events.len(), 1);
    }

    #[test]
    fn test_blocked_command_reports_every_outcome() {
        let engine = engine();
        // Both the block and the warn constraint are violated; the
        // caller must see both.
        let snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "open", "claimedBy": "emp-2", "quantity": 0
        }));
        let execution = engine.execute(
            &request("claim", None, json!({ "employeeId": "emp-7" })),
            &snapshot,
        );

        let outcome = execution.completed().expect("completed");
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.outcomes.len(), 2);
        assert_eq!(outcome.result.outcomes[0].rule, "notClaimed");
        assert_eq!(outcome.result.outcomes[0].message, "Task is already claimed");
        assert_eq!(outcome.result.outcomes[0].field.as_deref(), Some("claimedBy"));
        assert_eq!(outcome.result.outcomes[1].rule, "hasQuantity");
        // No events, no state change, no clock movement.
        assert!(outcome.result.events.is_empty());
        assert_eq!(outcome.new_state, snapshot.state);
        assert_eq!(outcome.clock, snapshot.clock);
        assert_eq!(outcome.last_seq, snapshot.last_seq);
    }

    #[test]
    fn test_fatal_constraint_blocks() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "in_progress", "claimedBy": "emp-2", "quantity": 1
        }));
        let execution = engine.execute(&request("cancel", None, json!({})), &snapshot);

        let outcome = execution.completed().expect("completed");
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.max_severity(), Some(Severity::Fatal));
    }

    #[test]
    fn test_unknown_command_is_not_found() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({}));
        let execution = engine.execute(&request("vanish", None, json!({})), &snapshot);
        assert!(matches!(execution, Execution::NotFound { .. }));
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({}));
        let execution = engine.execute(&request("claim", Some("Ghost"), json!({})), &snapshot);
        let Execution::NotFound { message, .. } = execution else {
            panic!("expected NotFound");
        };
        assert!(message.contains("entity 'Ghost'"));
    }

    #[test]
    fn test_colliding_name_requires_entity() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({}));

        let bare = engine.execute(&request("archive", None, json!({})), &snapshot);
        let Execution::NotFound { message, .. } = bare else {
            panic!("expected NotFound for ambiguous name");
        };
        assert!(message.contains("multiple entities"));

        let pinned = engine.execute(&request("archive", Some("Menu"), json!({})), &snapshot);
        let outcome = pinned.completed().expect("completed");
        assert_eq!(outcome.entity, "Menu");
        assert_eq!(outcome.result.events[0].event_type, "menu.archived");
    }

    #[test]
    fn test_success_merges_declared_payload_fields_into_state() {
        let engine = engine();
        let snapshot = AggregateSnapshot::new(json!({
            "id": "task-1", "status": "open", "claimedBy": "", "quantity": 4
        }));
        let execution = engine.execute(
            &request(
                "claim",
                None,
                json!({ "employeeId": "emp-7", "quantity": 9, "unrelated": true }),
            ),
            &snapshot,
        );

        let outcome = execution.completed().expect("completed");
        // "quantity" is a declared property, "employeeId"/"unrelated" are not.
        assert_eq!(outcome.new_state["quantity"], json!(9));
        assert_eq!(outcome.new_state["status"], json!("open"));
        assert!(outcome.new_state.get("unrelated").is_none());
        assert!(outcome.new_state.get("employeeId").is_none());
    }

    #[test]
    fn test_engine_is_cheap_to_share() {
        let engine = engine();
        let clone = engine.clone();
        assert_eq!(engine.ir().digest, clone.ir().digest);
    }
}
