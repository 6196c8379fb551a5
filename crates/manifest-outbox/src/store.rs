//! Storage trait definitions for the outbox layer.
//!
//! Two traits capture the persistence collaborator contract:
//! - [`AggregateStore`]: "mutate state + insert N outbox rows" as one
//!   atomic commit
//! - [`OutboxStore`]: atomic claiming plus the publisher-side status
//!   transitions
//!
//! Both are async and backend-agnostic. The in-memory implementation
//! for tests lives in `memory`; the SurrealDB backend in `surreal`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::OutboxResult;
use crate::record::{AggregateRow, CommandTransaction, OutboxId, OutboxRecord};

/// Transactional writes of aggregate state plus outbox rows.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Commit an aggregate mutation and its outbox inserts atomically:
    /// either everything is durable or nothing is. A duplicate
    /// per-aggregate sequence aborts the whole commit.
    async fn commit(&self, txn: CommandTransaction) -> OutboxResult<()>;

    /// Load an aggregate row for snapshotting.
    async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> OutboxResult<Option<AggregateRow>>;
}

/// Publisher-side view of the outbox table.
///
/// Claiming is an atomic conditional transition (pending → publishing
/// with a claimant stamp), so concurrent workers never double-claim.
/// Every publisher-side transition re-checks the claimant: a worker
/// that lost its claim to the sweeper cannot move a row another worker
/// now owns, which is what keeps delivery exactly-once-observable.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due pending rows for `claimant`.
    ///
    /// Rows come back in per-aggregate sequence order, and an aggregate
    /// with a row currently claimed by another worker (or an earlier
    /// row still backing off) is skipped entirely, so per-aggregate
    /// delivery order is the store's responsibility.
    async fn claim_batch(&self, claimant: &str, limit: usize) -> OutboxResult<Vec<OutboxRecord>>;

    /// Transition a row this claimant holds to published. Returns
    /// `false` (leaving the row untouched) when the claim is stale.
    async fn mark_published(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool>;

    /// Return a failed row to pending, bumping `attempts` and delaying
    /// the next claim by `retry_after`.
    async fn retry_later(
        &self,
        id: &OutboxId,
        claimant: &str,
        error: &str,
        retry_after: Duration,
    ) -> OutboxResult<bool>;

    /// Return a claimed row to pending without counting an attempt
    /// (ordered-delivery skip after an earlier row of the same
    /// aggregate failed, graceful shutdown).
    async fn release(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool>;

    /// Park a row as dead for operator inspection. Never retried.
    async fn mark_dead(&self, id: &OutboxId, claimant: &str, error: &str) -> OutboxResult<bool>;

    /// Requeue rows stuck in publishing longer than `claim_timeout`
    /// (crash recovery). Returns how many rows were requeued.
    async fn requeue_stuck(&self, claim_timeout: Duration) -> OutboxResult<u64>;

    /// Age of the oldest pending row, for monitoring.
    async fn pending_age(&self) -> OutboxResult<Option<Duration>>;

    /// Fetch one record by id.
    async fn get(&self, id: &OutboxId) -> OutboxResult<Option<OutboxRecord>>;

    /// All dead rows, for operator inspection.
    async fn dead_letters(&self) -> OutboxResult<Vec<OutboxRecord>>;
}
