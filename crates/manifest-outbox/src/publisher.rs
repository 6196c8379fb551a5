//! Outbox publisher worker: claim, publish, retry, dead-letter, sweep.
//!
//! Publishers are fully decoupled from command execution: a command's
//! caller gets its response when the transaction commits, and delivery
//! latency or channel backpressure never propagates back. Any number of
//! workers may run concurrently; the store's claim discipline keeps
//! each row's delivery exactly-once-observable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::record::EventEnvelope;
use crate::store::OutboxStore;

/// Realtime channel the publisher delivers envelopes to.
///
/// Transport selection is out of scope: implementations only promise
/// to accept an envelope or report failure.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), ChannelError>;
}

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("Channel rejected publish: {0}")]
    Rejected(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

/// Publisher tuning knobs.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Rows claimed per drain cycle, clamped to 1..=500.
    pub batch_size: usize,
    /// Attempts before a row is parked as dead.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Publishing rows older than this are swept back to pending.
    pub claim_timeout: Duration,
    /// Envelopes larger than this go straight to dead.
    pub max_payload_bytes: usize,
    /// Idle delay between worker cycles.
    pub poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            batch_size: 100,
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(30),
            max_payload_bytes: 64 * 1024,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Counters from one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: u64,
    pub retried: u64,
    pub dead: u64,
    pub released: u64,
}

/// Claims pending outbox rows and pushes their envelopes to the
/// realtime channel.
pub struct Publisher {
    store: Arc<dyn OutboxStore>,
    channel: Arc<dyn EventChannel>,
    config: PublisherConfig,
    claimant: String,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        channel: Arc<dyn EventChannel>,
        config: PublisherConfig,
    ) -> Self {
        let claimant = format!("publisher-{}", Uuid::new_v4());
        Self::with_claimant(store, channel, config, claimant)
    }

    /// Fixed claimant identity (tests, stable worker names).
    pub fn with_claimant(
        store: Arc<dyn OutboxStore>,
        channel: Arc<dyn EventChannel>,
        config: PublisherConfig,
        claimant: impl Into<String>,
    ) -> Self {
        Publisher {
            store,
            channel,
            config,
            claimant: claimant.into(),
        }
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    /// One claim-and-publish cycle.
    ///
    /// Rows of one aggregate are published in sequence order. When a
    /// row fails, the aggregate's remaining claimed rows are released
    /// untouched so a later event can never overtake an earlier one.
    pub async fn drain_once(&self) -> OutboxResult<PublishReport> {
        let limit = self.config.batch_size.clamp(1, 500);
        let rows = self.store.claim_batch(&self.claimant, limit).await?;
        let mut report = PublishReport::default();
        let mut stalled: HashSet<(String, String)> = HashSet::new();

        for row in rows {
            let key = (row.aggregate_type.clone(), row.aggregate_id.clone());
            if stalled.contains(&key) {
                if self.store.release(&row.id, &self.claimant).await? {
                    report.released += 1;
                }
                continue;
            }

            let envelope = row.envelope();
            let size = serde_json::to_vec(&envelope)
                .map(|bytes| bytes.len())
                .unwrap_or(usize::MAX);
            if size > self.config.max_payload_bytes {
                warn!(
                    id = %row.id,
                    size,
                    limit = self.config.max_payload_bytes,
                    "envelope exceeds channel limit, parking as dead"
                );
                if self
                    .store
                    .mark_dead(&row.id, &self.claimant, "payload exceeds channel maximum")
                    .await?
                {
                    report.dead += 1;
                }
                continue;
            }

            match self.channel.publish(&envelope).await {
                Ok(()) => {
                    if self.store.mark_published(&row.id, &self.claimant).await? {
                        report.published += 1;
                    }
                }
                Err(err) => {
                    stalled.insert(key);
                    if row.attempts + 1 >= self.config.max_attempts {
                        warn!(
                            id = %row.id,
                            attempts = row.attempts + 1,
                            error = %err,
                            "retries exhausted, parking as dead"
                        );
                        if self
                            .store
                            .mark_dead(&row.id, &self.claimant, &err.to_string())
                            .await?
                        {
                            report.dead += 1;
                        }
                    } else {
                        let delay = self.backoff(row.attempts);
                        debug!(id = %row.id, ?delay, error = %err, "publish failed, retrying");
                        if self
                            .store
                            .retry_later(&row.id, &self.claimant, &err.to_string(), delay)
                            .await?
                        {
                            report.retried += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Requeue rows whose claimant died mid-publish.
    pub async fn sweep(&self) -> OutboxResult<u64> {
        let swept = self.store.requeue_stuck(self.config.claim_timeout).await?;
        if swept > 0 {
            info!(swept, "requeued stuck publishing rows");
        }
        Ok(swept)
    }

    /// Exponential backoff, capped at `max_backoff`.
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    /// Run sweep + drain on an interval until `shutdown` flips to true.
    pub async fn run_worker(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await?;
                    let report = self.drain_once().await?;
                    if report.published > 0 {
                        debug!(published = report.published, "drained outbox batch");
                    }
                }
            }
        }
        info!(claimant = %self.claimant, "publisher worker stopped");
        Ok(())
    }
}
