use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use tally_core::{AggregateId, ExpectedVersion, TenantId};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle: domain event (from `handle`) → `UncommittedEvent` (wrapped with
/// stream metadata) → `StoredEvent` (persisted, sequence assigned) →
/// `EventEnvelope` (published to consumers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are stream-scoped (tenant_id + aggregate_id), assigned by
/// the store during append, strictly increasing, and immutable. They drive
/// ordering, optimistic concurrency and projection idempotency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a tenant-scoped event envelope for publication.
    pub fn to_envelope(&self) -> tally_events::EventEnvelope<JsonValue> {
        tally_events::EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// One stream's contribution to an atomic multi-stream append.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    pub events: Vec<UncommittedEvent>,
    pub expected_version: ExpectedVersion,
}

/// Event store operation error.
///
/// Infrastructure failures (storage, concurrency, isolation), as opposed to
/// domain errors. `Concurrency` is the retryable class.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only, tenant-scoped event store.
///
/// Events are organized into streams, one per aggregate instance, keyed by
/// `(tenant_id, aggregate_id)`. Within a stream, sequence numbers increase
/// monotonically from 1 with no gaps.
///
/// Implementations must:
/// - enforce tenant isolation (reject cross-tenant operations)
/// - enforce optimistic concurrency against the current stream version
/// - assign sequence numbers monotonically
/// - persist each append atomically (all events in a batch or none)
pub trait EventStore: Send + Sync {
    /// Append events to a single aggregate stream (append-only).
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append to several streams atomically: either every batch commits or
    /// none does.
    ///
    /// This is what keeps a purchase-order receipt consistent — the status
    /// change and the per-line stock movements land together or not at all.
    /// Each batch targets one stream; a call may not contain two batches for
    /// the same stream.
    fn append_batch(&self, batches: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a tenant + aggregate.
    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn append_batch(&self, batches: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_batch(batches)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Keeps infra decoupled from business, while still capturing event
    /// metadata needed for future deserialization.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: tally_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
