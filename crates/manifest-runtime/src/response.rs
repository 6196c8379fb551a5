//! Maps command executions to protocol-level responses.
//!
//! Pure function of the execution result; no persistence, no network.
//! The status depends only on the worst severity present:
//! fatal → 422, block → 409, unknown command/entity → 404, warn/info or
//! clean success → 200.

use manifest_lang::Severity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::result::Execution;

/// Protocol-level outcome: status code plus structured body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Map an execution to its response.
///
/// The body always carries `outcomes` when any were recorded, so a 200
/// with warnings and a 409 with the blocking reason both surface every
/// applicable finding in one payload.
pub fn to_response(execution: &Execution) -> ApiResponse {
    match execution {
        Execution::NotFound {
            command,
            entity,
            message,
        } => {
            let mut body = Map::new();
            body.insert("success".to_string(), Value::Bool(false));
            body.insert("message".to_string(), Value::String(message.clone()));
            body.insert("command".to_string(), Value::String(command.clone()));
            if let Some(entity) = entity {
                body.insert("entity".to_string(), Value::String(entity.clone()));
            }
            ApiResponse {
                status: 404,
                body: Value::Object(body),
            }
        }
        Execution::Completed(outcome) => {
            let result = &outcome.result;
            let status = match result.max_severity() {
                Some(Severity::Fatal) => 422,
                Some(Severity::Block) => 409,
                _ => 200,
            };

            let mut body = Map::new();
            body.insert("success".to_string(), Value::Bool(result.success));
            if !result.outcomes.is_empty() {
                body.insert(
                    "outcomes".to_string(),
                    serde_json::to_value(&result.outcomes).unwrap_or(Value::Null),
                );
            }
            if result.success && !result.events.is_empty() {
                body.insert(
                    "events".to_string(),
                    serde_json::to_value(&result.events).unwrap_or(Value::Null),
                );
            }
            ApiResponse {
                status,
                body: Value::Object(body),
            }
        }
    }
}

/// Response for infrastructure failures (transaction aborts and the
/// like). Surfaces a retry hint and an opaque reference id, never
/// internal diagnostics.
pub fn infrastructure_error() -> ApiResponse {
    let reference = Uuid::new_v4().to_string();
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(false));
    body.insert(
        "message".to_string(),
        Value::String("temporary failure; re-read the aggregate and retry".to_string()),
    );
    body.insert("reference".to_string(), Value::String(reference));
    ApiResponse {
        status: 500,
        body: Value::Object(body),
    }
}
