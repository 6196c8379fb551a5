//! In-memory store and channel fakes (testing and examples).
//!
//! `MemoryStore` satisfies both storage traits without any external
//! dependencies; atomicity comes from doing all checks and writes under
//! one mutex acquisition.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{OutboxError, OutboxResult};
use crate::publisher::{ChannelError, EventChannel};
use crate::record::{
    AggregateRow, CommandTransaction, EventEnvelope, OutboxId, OutboxRecord, OutboxStatus,
};
use crate::store::{AggregateStore, OutboxStore};

#[derive(Debug, Default)]
struct Inner {
    aggregates: HashMap<(String, String), AggregateRow>,
    outbox: Vec<OutboxRecord>,
}

/// In-memory implementation of [`AggregateStore`] and [`OutboxStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox row, for test assertions.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().unwrap().outbox.clone()
    }
}

fn chrono_delay(delay: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

fn aggregate_key(record: &OutboxRecord) -> (String, String) {
    (record.aggregate_type.clone(), record.aggregate_id.clone())
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn commit(&self, txn: CommandTransaction) -> OutboxResult<()> {
        let mut inner = self.inner.lock().unwrap();

        // Validate before touching anything so a rejected commit leaves
        // no partial writes.
        for event in &txn.events {
            let duplicate = inner.outbox.iter().any(|row| {
                row.aggregate_type == event.aggregate_type
                    && row.aggregate_id == event.aggregate_id
                    && row.seq == event.seq
            });
            if duplicate {
                return Err(OutboxError::DuplicateSequence {
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    seq: event.seq,
                });
            }
        }

        let key = (
            txn.aggregate.aggregate_type.clone(),
            txn.aggregate.aggregate_id.clone(),
        );
        inner.aggregates.insert(key, txn.aggregate);
        inner.outbox.extend(txn.events);
        Ok(())
    }

    async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> OutboxResult<Option<AggregateRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .aggregates
            .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(&self, claimant: &str, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        // Aggregates with an in-flight claim are skipped entirely so
        // per-aggregate order holds across workers.
        let busy: HashSet<(String, String)> = inner
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Publishing)
            .map(aggregate_key)
            .collect();

        // Group claimable rows per aggregate, in seq order, stopping at
        // the first row still backing off; a later row must not jump
        // the queue.
        let mut per_aggregate: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (idx, row) in inner.outbox.iter().enumerate() {
            if row.status == OutboxStatus::Pending && !busy.contains(&aggregate_key(row)) {
                per_aggregate.entry(aggregate_key(row)).or_default().push(idx);
            }
        }

        let mut claimable: Vec<usize> = Vec::new();
        for indices in per_aggregate.values_mut() {
            indices.sort_by_key(|&idx| inner.outbox[idx].seq);
            for &idx in indices.iter() {
                let due = inner.outbox[idx]
                    .next_attempt_at
                    .map(|at| at <= now)
                    .unwrap_or(true);
                if !due {
                    break;
                }
                claimable.push(idx);
            }
        }

        claimable.sort_by_key(|&idx| (inner.outbox[idx].created_at, inner.outbox[idx].seq));
        claimable.truncate(limit);

        let mut claimed = Vec::with_capacity(claimable.len());
        for idx in claimable {
            let row = &mut inner.outbox[idx];
            row.status = OutboxStatus::Publishing;
            row.claimed_by = Some(claimant.to_string());
            row.claimed_at = Some(now);
            claimed.push(row.clone());
        }
        claimed.sort_by(|a, b| {
            (a.aggregate_type.as_str(), a.aggregate_id.as_str(), a.seq).cmp(&(
                b.aggregate_type.as_str(),
                b.aggregate_id.as_str(),
                b.seq,
            ))
        });
        Ok(claimed)
    }

    async fn mark_published(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let row = find_mut(&mut inner, id)?;
        if row.status != OutboxStatus::Publishing || row.claimed_by.as_deref() != Some(claimant) {
            return Ok(false);
        }
        row.status = OutboxStatus::Published;
        row.published_at = Some(Utc::now());
        row.claimed_by = None;
        row.claimed_at = None;
        Ok(true)
    }

    async fn retry_later(
        &self,
        id: &OutboxId,
        claimant: &str,
        error: &str,
        retry_after: Duration,
    ) -> OutboxResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let row = find_mut(&mut inner, id)?;
        if row.status != OutboxStatus::Publishing || row.claimed_by.as_deref() != Some(claimant) {
            return Ok(false);
        }
        row.status = OutboxStatus::Pending;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.next_attempt_at = Some(Utc::now() + chrono_delay(retry_after));
        row.claimed_by = None;
        row.claimed_at = None;
        Ok(true)
    }

    async fn release(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let row = find_mut(&mut inner, id)?;
        if row.status != OutboxStatus::Publishing || row.claimed_by.as_deref() != Some(claimant) {
            return Ok(false);
        }
        row.status = OutboxStatus::Pending;
        row.claimed_by = None;
        row.claimed_at = None;
        Ok(true)
    }

    async fn mark_dead(&self, id: &OutboxId, claimant: &str, error: &str) -> OutboxResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let row = find_mut(&mut inner, id)?;
        if row.status != OutboxStatus::Publishing || row.claimed_by.as_deref() != Some(claimant) {
            return Ok(false);
        }
        row.status = OutboxStatus::Dead;
        row.last_error = Some(error.to_string());
        row.claimed_by = None;
        row.claimed_at = None;
        Ok(true)
    }

    async fn requeue_stuck(&self, claim_timeout: Duration) -> OutboxResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono_delay(claim_timeout);
        let mut requeued = 0u64;
        for row in inner.outbox.iter_mut() {
            let expired = row.status == OutboxStatus::Publishing
                && row.claimed_at.map(|at| at <= cutoff).unwrap_or(true);
            if expired {
                row.status = OutboxStatus::Pending;
                row.claimed_by = None;
                row.claimed_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn pending_age(&self) -> OutboxResult<Option<Duration>> {
        let inner = self.inner.lock().unwrap();
        let oldest: Option<DateTime<Utc>> = inner
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .map(|row| row.created_at)
            .min();
        Ok(oldest.and_then(|at| (Utc::now() - at).to_std().ok()))
    }

    async fn get(&self, id: &OutboxId) -> OutboxResult<Option<OutboxRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.outbox.iter().find(|row| row.id == *id).cloned())
    }

    async fn dead_letters(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Dead)
            .cloned()
            .collect())
    }
}

fn find_mut<'a>(inner: &'a mut Inner, id: &OutboxId) -> OutboxResult<&'a mut OutboxRecord> {
    inner
        .outbox
        .iter_mut()
        .find(|row| row.id == *id)
        .ok_or_else(|| OutboxError::RecordNotFound { id: id.to_string() })
}

/// Channel fake that records envelopes and can be scripted to fail.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    published: Mutex<Vec<EventEnvelope>>,
    fail_next: Mutex<u32>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail.
    pub fn fail_times(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), ChannelError> {
        {
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChannelError::Unavailable("injected failure".to_string()));
            }
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}
