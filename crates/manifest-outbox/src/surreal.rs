//! SurrealDB-backed outbox store.
//!
//! Uses DB row structs converting to/from the `record` types at the
//! boundary. The claim primitive is a per-row compare-and-swap
//! (`UPDATE ... WHERE status = 'pending' RETURN AFTER`): a row lost to
//! a racing worker simply comes back empty, and the whole aggregate is
//! skipped for this cycle so sequence order holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{OutboxError, OutboxResult};
use crate::record::{
    AggregateRow, CommandTransaction, OutboxId, OutboxRecord, OutboxStatus,
};
use crate::store::{AggregateStore, OutboxStore};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// `aggregates` table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbAggregate {
    /// SurrealDB record ID
    id: Option<surrealdb::sql::Thing>,
    aggregate_type: String,
    aggregate_id: String,
    state: serde_json::Value,
    last_seq: u64,
    clock: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    updated_at: DateTime<Utc>,
}

impl DbAggregate {
    fn from_row(row: &AggregateRow) -> OutboxResult<Self> {
        Ok(DbAggregate {
            id: None,
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            state: row.state.clone(),
            last_seq: row.last_seq,
            clock: serde_json::to_value(&row.clock)?,
            updated_at: row.updated_at,
        })
    }

    fn into_row(self) -> OutboxResult<AggregateRow> {
        Ok(AggregateRow {
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            state: self.state,
            last_seq: self.last_seq,
            clock: serde_json::from_value(self.clock)?,
            updated_at: self.updated_at,
        })
    }
}

/// `outbox_events` table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbOutboxEvent {
    /// SurrealDB record ID
    id: Option<surrealdb::sql::Thing>,
    record_id: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
    seq: u64,
    clock: serde_json::Value,
    status: String,
    attempts: u32,
    claimed_by: Option<String>,
    last_error: Option<String>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    claimed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    published_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    next_attempt_at: Option<DateTime<Utc>>,
}

impl DbOutboxEvent {
    fn from_record(record: &OutboxRecord) -> OutboxResult<Self> {
        Ok(DbOutboxEvent {
            id: None,
            record_id: record.id.0.clone(),
            aggregate_type: record.aggregate_type.clone(),
            aggregate_id: record.aggregate_id.clone(),
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            seq: record.seq,
            clock: serde_json::to_value(&record.clock)?,
            status: record.status.as_str().to_string(),
            attempts: record.attempts,
            claimed_by: record.claimed_by.clone(),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            claimed_at: record.claimed_at,
            published_at: record.published_at,
            next_attempt_at: record.next_attempt_at,
        })
    }

    fn into_record(self) -> OutboxResult<OutboxRecord> {
        let status = OutboxStatus::parse(&self.status)
            .ok_or_else(|| OutboxError::Backend(format!("unknown outbox status: {}", self.status)))?;
        Ok(OutboxRecord {
            id: OutboxId(self.record_id),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            seq: self.seq,
            clock: serde_json::from_value(self.clock)?,
            status,
            attempts: self.attempts,
            claimed_by: self.claimed_by,
            last_error: self.last_error,
            created_at: self.created_at,
            claimed_at: self.claimed_at,
            published_at: self.published_at,
            next_attempt_at: self.next_attempt_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AggregateKeyRow {
    aggregate_type: String,
    aggregate_id: String,
}

/// SurrealDB-backed implementation of [`AggregateStore`] and
/// [`OutboxStore`].
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `manifest/main`, and runs
    /// `init_schema`.
    pub async fn in_memory() -> OutboxResult<Self> {
        let db = surrealdb::engine::any::connect("mem://")
            .await
            .map_err(|e| OutboxError::Connection(e.to_string()))?;

        db.use_ns("manifest")
            .use_db("main")
            .await
            .map_err(|e| OutboxError::Connection(e.to_string()))?;

        init_schema(&db).await?;

        info!("SurrealStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Honors `SURREALDB_URL`; otherwise falls back to local
    /// persistence in `.manifest/db`.
    pub async fn from_env() -> OutboxResult<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let db = surrealdb::engine::any::connect(&url)
                .await
                .map_err(|e| OutboxError::Connection(e.to_string()))?;

            db.use_ns("manifest")
                .use_db("main")
                .await
                .map_err(|e| OutboxError::Connection(e.to_string()))?;

            init_schema(&db).await?;
            info!("SurrealStore connected ({})", url);
            return Ok(Self { db });
        }

        let path = ".manifest/db";
        std::fs::create_dir_all(path).map_err(|e| {
            OutboxError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
        let url = format!("surrealkv://{}", path);
        info!(
            "No SURREALDB_URL found, using local persistence: {}",
            url
        );

        let db = surrealdb::engine::any::connect(&url)
            .await
            .map_err(|e| OutboxError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("manifest")
            .use_db("main")
            .await
            .map_err(|e| OutboxError::Connection(e.to_string()))?;

        init_schema(&db).await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_event(&self, record_id: &str) -> OutboxResult<Option<DbOutboxEvent>> {
        let rid = record_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM outbox_events WHERE record_id = $rid")
            .bind(("rid", rid))
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;

        let rows: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// Claimant-guarded status transition. Returns whether a row moved.
    async fn transition(
        &self,
        id: &OutboxId,
        claimant: &str,
        set_clause: &str,
        binds: Vec<(String, surrealdb::sql::Value)>,
    ) -> OutboxResult<bool> {
        if self.fetch_event(&id.0).await?.is_none() {
            return Err(OutboxError::RecordNotFound { id: id.to_string() });
        }

        let sql = format!(
            "UPDATE outbox_events SET {set_clause} \
             WHERE record_id = $rid AND status = 'publishing' AND claimed_by = $claimant \
             RETURN AFTER"
        );
        let mut query = self
            .db
            .query(sql)
            .bind(("rid", id.0.clone()))
            .bind(("claimant", claimant.to_string()));
        for (key, value) in binds {
            query = query.bind((key, value));
        }
        let mut res = query
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;

        let rows: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl AggregateStore for SurrealStore {
    async fn commit(&self, txn: CommandTransaction) -> OutboxResult<()> {
        let aggregate = DbAggregate::from_row(&txn.aggregate)?;

        // One multi-statement transaction: replace the aggregate row and
        // insert every outbox event, or nothing. The unique
        // (aggregate_type, aggregate_id, seq) index aborts the whole
        // transaction on a duplicate sequence.
        let mut sql = String::from("BEGIN TRANSACTION;");
        sql.push_str(
            "DELETE aggregates WHERE aggregate_type = $at AND aggregate_id = $aid;",
        );
        sql.push_str("CREATE aggregates CONTENT $agg;");
        for i in 0..txn.events.len() {
            sql.push_str(&format!("CREATE outbox_events CONTENT $ev{i};"));
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = self
            .db
            .query(sql)
            .bind(("at", txn.aggregate.aggregate_type.clone()))
            .bind(("aid", txn.aggregate.aggregate_id.clone()))
            .bind(("agg", aggregate));
        for (i, event) in txn.events.iter().enumerate() {
            query = query.bind((format!("ev{i}"), DbOutboxEvent::from_record(event)?));
        }

        let res = query
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        res.check()
            .map_err(|e| OutboxError::Backend(e.to_string()))?;

        debug!(
            aggregate = %txn.aggregate.aggregate_id,
            events = txn.events.len(),
            "committed aggregate mutation with outbox rows"
        );
        Ok(())
    }

    async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> OutboxResult<Option<AggregateRow>> {
        let at = aggregate_type.to_string();
        let aid = aggregate_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM aggregates WHERE aggregate_type = $at AND aggregate_id = $aid")
            .bind(("at", at))
            .bind(("aid", aid))
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;

        let rows: Vec<DbAggregate> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        rows.into_iter().next().map(DbAggregate::into_row).transpose()
    }
}

#[async_trait]
impl OutboxStore for SurrealStore {
    async fn claim_batch(&self, claimant: &str, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let now = surrealdb::sql::Datetime::from(Utc::now());

        // Aggregates with an in-flight claim are skipped for this cycle.
        let mut res = self
            .db
            .query(
                "SELECT aggregate_type, aggregate_id FROM outbox_events \
                 WHERE status = 'publishing'",
            )
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let busy_rows: Vec<AggregateKeyRow> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let mut stalled: HashSet<(String, String)> = busy_rows
            .into_iter()
            .map(|row| (row.aggregate_type, row.aggregate_id))
            .collect();

        // Due pending rows, oldest first.
        let mut res = self
            .db
            .query(
                "SELECT * FROM outbox_events \
                 WHERE status = 'pending' \
                 AND (next_attempt_at IS NONE OR next_attempt_at IS NULL OR next_attempt_at <= $now) \
                 ORDER BY created_at ASC LIMIT $limit",
            )
            .bind(("now", now.clone()))
            .bind(("limit", limit))
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let mut candidates: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        candidates.sort_by(|a, b| {
            (a.aggregate_type.as_str(), a.aggregate_id.as_str(), a.seq).cmp(&(
                b.aggregate_type.as_str(),
                b.aggregate_id.as_str(),
                b.seq,
            ))
        });

        // Per-row compare-and-swap. Losing the race on any row stalls
        // the rest of its aggregate so order is preserved.
        let mut claimed = Vec::new();
        for candidate in candidates {
            if claimed.len() >= limit {
                break;
            }
            let key = (
                candidate.aggregate_type.clone(),
                candidate.aggregate_id.clone(),
            );
            if stalled.contains(&key) {
                continue;
            }

            let rid = candidate.record_id.clone();
            let mut res = self
                .db
                .query(
                    "UPDATE outbox_events \
                     SET status = 'publishing', claimed_by = $claimant, claimed_at = $now \
                     WHERE record_id = $rid AND status = 'pending' \
                     RETURN AFTER",
                )
                .bind(("rid", rid))
                .bind(("claimant", claimant.to_string()))
                .bind(("now", now.clone()))
                .await
                .map_err(|e| OutboxError::Backend(e.to_string()))?;
            let rows: Vec<DbOutboxEvent> = res
                .take(0)
                .map_err(|e| OutboxError::Backend(e.to_string()))?;

            match rows.into_iter().next() {
                Some(row) => claimed.push(row.into_record()?),
                None => {
                    stalled.insert(key);
                }
            }
        }

        debug!(claimant, claimed = claimed.len(), "claimed outbox batch");
        Ok(claimed)
    }

    async fn mark_published(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool> {
        let now = surrealdb::sql::Datetime::from(Utc::now());
        self.transition(
            id,
            claimant,
            "status = 'published', published_at = $now, claimed_by = NONE, claimed_at = NONE",
            vec![("now".to_string(), now.into())],
        )
        .await
    }

    async fn retry_later(
        &self,
        id: &OutboxId,
        claimant: &str,
        error: &str,
        retry_after: Duration,
    ) -> OutboxResult<bool> {
        let next = Utc::now()
            + chrono::Duration::milliseconds(retry_after.as_millis().min(i64::MAX as u128) as i64);
        let next = surrealdb::sql::Datetime::from(next);
        self.transition(
            id,
            claimant,
            "status = 'pending', attempts += 1, last_error = $err, \
             next_attempt_at = $next, claimed_by = NONE, claimed_at = NONE",
            vec![
                ("err".to_string(), error.into()),
                ("next".to_string(), next.into()),
            ],
        )
        .await
    }

    async fn release(&self, id: &OutboxId, claimant: &str) -> OutboxResult<bool> {
        self.transition(
            id,
            claimant,
            "status = 'pending', claimed_by = NONE, claimed_at = NONE",
            vec![],
        )
        .await
    }

    async fn mark_dead(&self, id: &OutboxId, claimant: &str, error: &str) -> OutboxResult<bool> {
        self.transition(
            id,
            claimant,
            "status = 'dead', last_error = $err, claimed_by = NONE, claimed_at = NONE",
            vec![("err".to_string(), error.into())],
        )
        .await
    }

    async fn requeue_stuck(&self, claim_timeout: Duration) -> OutboxResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(claim_timeout.as_millis().min(i64::MAX as u128) as i64);
        let cutoff = surrealdb::sql::Datetime::from(cutoff);

        let mut res = self
            .db
            .query(
                "UPDATE outbox_events \
                 SET status = 'pending', claimed_by = NONE, claimed_at = NONE \
                 WHERE status = 'publishing' AND claimed_at <= $cutoff \
                 RETURN AFTER",
            )
            .bind(("cutoff", cutoff))
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let rows: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        Ok(rows.len() as u64)
    }

    async fn pending_age(&self) -> OutboxResult<Option<Duration>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM outbox_events WHERE status = 'pending' \
                 ORDER BY created_at ASC LIMIT 1",
            )
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let rows: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| (Utc::now() - row.created_at).to_std().ok()))
    }

    async fn get(&self, id: &OutboxId) -> OutboxResult<Option<OutboxRecord>> {
        self.fetch_event(&id.0)
            .await?
            .map(DbOutboxEvent::into_record)
            .transpose()
    }

    async fn dead_letters(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM outbox_events WHERE status = 'dead' ORDER BY created_at ASC")
            .await
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        let rows: Vec<DbOutboxEvent> = res
            .take(0)
            .map_err(|e| OutboxError::Backend(e.to_string()))?;
        rows.into_iter().map(DbOutboxEvent::into_record).collect()
    }
}

/// Initialize outbox tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
async fn init_schema(db: &Surreal<Any>) -> OutboxResult<()> {
    debug!("Initializing outbox SurrealDB schema");

    let sql = r#"
        DEFINE TABLE aggregates
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete FULL;

        -- One row per aggregate instance
        DEFINE INDEX idx_aggregate_key ON TABLE aggregates COLUMNS aggregate_type, aggregate_id UNIQUE;

        DEFINE TABLE outbox_events
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- Stable external id for claim CAS
        DEFINE INDEX idx_record_id ON TABLE outbox_events COLUMNS record_id UNIQUE;

        -- Per-aggregate ordering authority; duplicate seq aborts the commit
        DEFINE INDEX idx_aggregate_seq ON TABLE outbox_events COLUMNS aggregate_type, aggregate_id, seq UNIQUE;

        -- Publisher scan path
        DEFINE INDEX idx_status ON TABLE outbox_events COLUMNS status;
        DEFINE INDEX idx_status_created ON TABLE outbox_events COLUMNS status, created_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| OutboxError::Backend(e.to_string()))?;
    info!("outbox schema initialized");
    Ok(())
}
