//! Causality tracking for Manifest aggregates.
//!
//! Two pieces live here:
//! - [`VectorClock`]: a per-aggregate actor→counter map whose merge is a
//!   join semilattice, so independent receivers converge regardless of
//!   delivery order or multiplicity.
//! - [`ConflictDetector`]: classifies two concurrent operations by the
//!   resource footprints they touch, producing typed, severity-ranked
//!   conflict records.
//!
//! Neither piece performs I/O; both are safe to run anywhere in the
//! event pipeline without a central coordinator.

pub mod clock;
pub mod conflict;

pub use clock::{ClockOrdering, VectorClock};
pub use conflict::{
    ConflictDetector, ConflictPolicy, ConflictRecord, ConflictSeverity, Footprint, OperationStamp,
    ResourceKind,
};
