//! Runtime engine and response mapping for compiled Manifest IR.
//!
//! [`RuntimeEngine`] resolves a command name against the IR, evaluates
//! its constraints against an aggregate snapshot, and on success
//! materializes events with monotonic per-aggregate sequence numbers
//! and an incremented vector clock. [`to_response`] turns the result
//! into a protocol-level status and body.
//!
//! Business-rule rejections are returned as data, not errors; only
//! infrastructure failures use `Err` paths (and those live in the
//! persistence layer, not here).

pub mod engine;
pub mod eval;
pub mod response;
pub mod result;

pub use engine::RuntimeEngine;
pub use response::{infrastructure_error, to_response, ApiResponse};
pub use result::{
    AggregateSnapshot, CommandOutcome, CommandRequest, CommandResult, ConstraintOutcome,
    EmittedEvent, Execution,
};
