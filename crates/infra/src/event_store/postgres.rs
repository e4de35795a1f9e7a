//! Postgres-backed event store implementation.
//!
//! Persists events append-only with tenant isolation and optimistic
//! concurrency enforced at the database level: the unique constraint on
//! `(tenant_id, aggregate_id, sequence_number)` makes a lost version race
//! surface as a `Concurrency` error rather than a corrupted stream.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use tally_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// Schema for the events table. Applied by `ensure_schema` (dev/test); in
/// production the migration pipeline owns this DDL.
const EVENTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INT NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (tenant_id, aggregate_id, sequence_number)
)
"#;

/// Postgres-backed append-only event store.
///
/// All operations go through the SQLx connection pool (thread-safe). Every
/// query filters on `tenant_id`; it is impossible to load or append events
/// for another tenant through this type.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the events table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::query(EVENTS_DDL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Load all events for a tenant + aggregate stream, in sequence order.
    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            aggregate_id = %aggregate_id.as_uuid()
        ),
        err
    )]
    pub async fn load_stream_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(stored_event_from_row).collect()
    }

    /// Append events to several streams in one transaction.
    ///
    /// Single-stream appends go through this too (one batch). A concurrent
    /// append to any touched stream rolls the whole transaction back with
    /// `Concurrency`, so a purchase-order receipt can never land half its
    /// movements.
    #[instrument(skip(self, batches), fields(batch_count = batches.len()), err)]
    pub async fn append_batches(
        &self,
        batches: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::new();
        let mut touched: Vec<(TenantId, AggregateId)> = Vec::new();

        for batch in batches {
            let events = batch.events;
            if events.is_empty() {
                continue;
            }

            let tenant_id = events[0].tenant_id;
            let aggregate_id = events[0].aggregate_id;
            let aggregate_type = events[0].aggregate_type.clone();

            for (idx, e) in events.iter().enumerate() {
                if e.tenant_id != tenant_id {
                    return Err(EventStoreError::TenantIsolation(format!(
                        "batch contains multiple tenant_ids (index {idx})"
                    )));
                }
                if e.aggregate_id != aggregate_id {
                    return Err(EventStoreError::InvalidAppend(format!(
                        "batch contains multiple aggregate_ids (index {idx})"
                    )));
                }
            }

            if touched.contains(&(tenant_id, aggregate_id)) {
                return Err(EventStoreError::InvalidAppend(
                    "duplicate stream in atomic batch".to_string(),
                ));
            }
            touched.push((tenant_id, aggregate_id));

            let (current_version, existing_type) =
                check_stream_version(&mut tx, tenant_id, aggregate_id).await?;

            if let Some(ref existing) = existing_type {
                if existing != &aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                    )));
                }
            }

            if !batch.expected_version.matches(current_version) {
                return Err(EventStoreError::Concurrency(format!(
                    "expected {:?}, found {current_version}",
                    batch.expected_version
                )));
            }

            let mut next_sequence = current_version + 1;
            for event in events {
                sqlx::query(
                    r#"
                    INSERT INTO events (
                        event_id,
                        tenant_id,
                        aggregate_id,
                        aggregate_type,
                        sequence_number,
                        event_type,
                        event_version,
                        occurred_at,
                        payload
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(event.event_id)
                .bind(tenant_id.as_uuid())
                .bind(aggregate_id.as_uuid())
                .bind(&aggregate_type)
                .bind(next_sequence as i64)
                .bind(&event.event_type)
                .bind(event.event_version as i32)
                .bind(event.occurred_at)
                .bind(&event.payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EventStoreError::Concurrency(format!(
                            "concurrent append detected: sequence_number {next_sequence} already exists"
                        ))
                    } else {
                        map_sqlx_error("insert_event", e)
                    }
                })?;

                committed.push(StoredEvent {
                    event_id: event.event_id,
                    tenant_id: event.tenant_id,
                    aggregate_id: event.aggregate_id,
                    aggregate_type: event.aggregate_type,
                    sequence_number: next_sequence,
                    event_type: event.event_type,
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload,
                });
                next_sequence += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) as current_version,
            MAX(aggregate_type) as aggregate_type
        FROM events
        WHERE tenant_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row.try_get("current_version").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read current_version: {e}"))
    })?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read aggregate_type: {e}"))
    })?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

fn stored_event_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let read = |name: &str, e: sqlx::Error| {
        EventStoreError::InvalidAppend(format!("failed to read column {name}: {e}"))
    };

    let event_id: uuid::Uuid = row.try_get("event_id").map_err(|e| read("event_id", e))?;
    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(|e| read("tenant_id", e))?;
    let aggregate_id: uuid::Uuid = row
        .try_get("aggregate_id")
        .map_err(|e| read("aggregate_id", e))?;
    let aggregate_type: String = row
        .try_get("aggregate_type")
        .map_err(|e| read("aggregate_type", e))?;
    let sequence_number: i64 = row
        .try_get("sequence_number")
        .map_err(|e| read("sequence_number", e))?;
    let event_type: String = row.try_get("event_type").map_err(|e| read("event_type", e))?;
    let event_version: i32 = row
        .try_get("event_version")
        .map_err(|e| read("event_version", e))?;
    let occurred_at: DateTime<Utc> = row
        .try_get("occurred_at")
        .map_err(|e| read("occurred_at", e))?;
    let payload: serde_json::Value = row.try_get("payload").map_err(|e| read("payload", e))?;

    Ok(StoredEvent {
        event_id,
        tenant_id: TenantId::from_uuid(tenant_id),
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        aggregate_type,
        sequence_number: sequence_number as u64,
        event_type,
        event_version: event_version as u32,
        occurred_at,
        payload,
    })
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::InvalidAppend(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::InvalidAppend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

impl EventStore for PostgresEventStore {
    // The EventStore trait is synchronous while Postgres operations are
    // async; bridge through the current tokio runtime handle. Callers must
    // be inside a runtime context.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_batch(vec![StreamAppend {
            events,
            expected_version,
        }])
    }

    fn append_batch(&self, batches: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let handle = runtime_handle()?;
        tokio::task::block_in_place(|| handle.block_on(self.append_batches(batches)))
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let handle = runtime_handle()?;
        tokio::task::block_in_place(|| handle.block_on(self.load_stream_events(tenant_id, aggregate_id)))
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::InvalidAppend(
            "PostgresEventStore requires a tokio runtime context".to_string(),
        )
    })
}
