//! Per-aggregate causal version vectors.
//!
//! Each collaborating actor owns one counter; the clock is the map of
//! all counters an aggregate has observed. Merging takes the per-actor
//! maximum, which is idempotent, commutative, and associative, so clocks
//! form a join semilattice and converge under any replay order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Every counter <= the other's, at least one strictly less.
    Before,
    /// Every counter >= the other's, at least one strictly greater.
    After,
    /// All counters identical.
    Equal,
    /// Neither clock dominates the other.
    Concurrent,
}

/// Vector clock: actor id → monotonically increasing counter.
///
/// Backed by a `BTreeMap` so serialization is deterministic; the clock
/// travels inside event envelopes and participates in digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for an actor; 0 if the actor has never committed.
    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Record a local commit by `actor`. Returns the new counter.
    pub fn increment(&mut self, actor: &str) -> u64 {
        let counter = self.0.entry(actor.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Join with another clock, taking the per-actor maximum.
    ///
    /// Pure: neither input is modified.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.0.clone();
        for (actor, &count) in &other.0 {
            let entry = merged.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        VectorClock(merged)
    }

    /// Causal comparison under the standard partial order: `Before` when
    /// every component is <= and at least one is strictly less, `After`
    /// for the mirror case, `Equal` when identical, otherwise
    /// `Concurrent`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for actor in self.0.keys().chain(other.0.keys()) {
            let ours = self.get(actor);
            let theirs = other.get(actor);
            if ours < theirs {
                less = true;
            } else if ours > theirs {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when neither clock dominates the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of actors tracked.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over `(actor, counter)` pairs in actor order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(actor, &count)| (actor.as_str(), count))
    }
}
