//! Causal-conflict detection for concurrent edits on shared resources.
//!
//! A conflict is raised only when two operations are vector-clock
//! concurrent *and* their resource footprints intersect. Detection is
//! side-effect free and symmetric in its arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::clock::{ClockOrdering, VectorClock};

/// Kind of shared resource a concurrent edit touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Scheduling,
    Resource,
    Staff,
    Inventory,
    Timeline,
}

/// Conflict severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The resources of one kind an operation touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub kind: ResourceKind,
    pub resources: BTreeSet<String>,
}

impl Footprint {
    pub fn new<I, S>(kind: ResourceKind, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Footprint {
            kind,
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }
}

/// One operation's causal stamp: its clock plus what it touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStamp {
    pub aggregate_id: String,
    pub clock: VectorClock,
    pub footprints: Vec<Footprint>,
}

impl OperationStamp {
    pub fn new(aggregate_id: impl Into<String>, clock: VectorClock) -> Self {
        OperationStamp {
            aggregate_id: aggregate_id.into(),
            clock,
            footprints: Vec::new(),
        }
    }

    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprints.push(footprint);
        self
    }
}

/// A detected concurrent-edit conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub severity: ConflictSeverity,
    /// Aggregates involved, sorted for argument-order independence.
    pub aggregates: Vec<String>,
    /// Resource ids both operations touched.
    pub resources: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
}

/// Severity pair for one conflict kind: full overlap vs. partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapSeverity {
    pub full: ConflictSeverity,
    pub partial: ConflictSeverity,
}

/// Severity policy keyed by conflict kind and overlap extent.
///
/// "Full" overlap means the intersection covers the smaller side's
/// entire resource set for that kind, e.g. a complete double-booking of
/// the same staff member, as opposed to two edits sharing one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    rules: BTreeMap<ResourceKind, OverlapSeverity>,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        use ConflictSeverity::*;
        let mut rules = BTreeMap::new();
        rules.insert(
            ResourceKind::Scheduling,
            OverlapSeverity {
                full: High,
                partial: Medium,
            },
        );
        rules.insert(
            ResourceKind::Staff,
            OverlapSeverity {
                full: Critical,
                partial: High,
            },
        );
        rules.insert(
            ResourceKind::Resource,
            OverlapSeverity {
                full: High,
                partial: Medium,
            },
        );
        rules.insert(
            ResourceKind::Inventory,
            OverlapSeverity {
                full: Medium,
                partial: Low,
            },
        );
        rules.insert(
            ResourceKind::Timeline,
            OverlapSeverity {
                full: Medium,
                partial: Low,
            },
        );
        ConflictPolicy { rules }
    }
}

impl ConflictPolicy {
    /// Override the severity pair for one kind.
    pub fn with_rule(mut self, kind: ResourceKind, rule: OverlapSeverity) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn severity(&self, kind: ResourceKind, full_overlap: bool) -> ConflictSeverity {
        match self.rules.get(&kind) {
            Some(rule) => {
                if full_overlap {
                    rule.full
                } else {
                    rule.partial
                }
            }
            None if full_overlap => ConflictSeverity::High,
            None => ConflictSeverity::Medium,
        }
    }
}

/// Classifies conflicts between pairs of concurrent operations.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    policy: ConflictPolicy,
}

impl ConflictDetector {
    pub fn new(policy: ConflictPolicy) -> Self {
        ConflictDetector { policy }
    }

    /// Detect conflicts between two operations.
    ///
    /// Returns one record per resource kind where both conditions hold:
    /// the clocks are mutually non-dominating, and the operations'
    /// resource sets for that kind intersect. Never mutates either
    /// clock; `detect(a, b)` and `detect(b, a)` classify identically.
    pub fn detect(&self, a: &OperationStamp, b: &OperationStamp) -> Vec<ConflictRecord> {
        if a.clock.compare(&b.clock) != ClockOrdering::Concurrent {
            return Vec::new();
        }

        let lhs = group_by_kind(&a.footprints);
        let rhs = group_by_kind(&b.footprints);

        let mut records = Vec::new();
        for (kind, left) in &lhs {
            let Some(right) = rhs.get(kind) else {
                continue;
            };
            let overlap: BTreeSet<String> = left.intersection(right).cloned().collect();
            if overlap.is_empty() {
                continue;
            }

            let full = overlap.len() == left.len().min(right.len());
            let severity = self.policy.severity(*kind, full);

            let mut aggregates = vec![a.aggregate_id.clone(), b.aggregate_id.clone()];
            aggregates.sort();
            aggregates.dedup();

            debug!(
                kind = ?kind,
                severity = ?severity,
                resources = overlap.len(),
                "conflict detected"
            );

            records.push(ConflictRecord {
                kind: *kind,
                severity,
                aggregates,
                resources: overlap,
                detected_at: Utc::now(),
            });
        }
        records
    }
}

/// Union an operation's footprints per kind so detection sees one
/// resource set per kind regardless of how footprints were split.
fn group_by_kind(footprints: &[Footprint]) -> BTreeMap<ResourceKind, BTreeSet<String>> {
    let mut grouped: BTreeMap<ResourceKind, BTreeSet<String>> = BTreeMap::new();
    for footprint in footprints {
        grouped
            .entry(footprint.kind)
            .or_default()
            .extend(footprint.resources.iter().cloned());
    }
    grouped
}
