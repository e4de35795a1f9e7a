use std::collections::HashMap;
use std::sync::RwLock;

use tally_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Validate one batch against the committed state of its stream.
    /// Returns the stream key and the version appends should start after.
    fn validate_batch(
        streams: &HashMap<StreamKey, Vec<StoredEvent>>,
        batch: &StreamAppend,
    ) -> Result<(StreamKey, u64), EventStoreError> {
        let events = &batch.events;
        if events.is_empty() {
            return Err(EventStoreError::InvalidAppend(
                "batch contains no events".to_string(),
            ));
        }

        let tenant_id = events[0].tenant_id;
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = &events[0].aggregate_type;

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
            if e.aggregate_type != *aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let stream: &[StoredEvent] = streams.get(&key).map(Vec::as_slice).unwrap_or_default();
        let current = Self::current_version(stream);

        if !batch.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {:?}, found {current}",
                batch.expected_version
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != *aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        Ok((key, current))
    }

    /// Commit a validated batch. Assigns sequence numbers and appends.
    fn commit_batch(
        streams: &mut HashMap<StreamKey, Vec<StoredEvent>>,
        key: StreamKey,
        current: u64,
        events: Vec<UncommittedEvent>,
    ) -> Vec<StoredEvent> {
        let stream = streams.entry(key).or_default();
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                tenant_id: e.tenant_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }
        committed
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let batch = StreamAppend {
            events,
            expected_version,
        };
        let (key, current) = Self::validate_batch(&streams, &batch)?;
        Ok(Self::commit_batch(&mut streams, key, current, batch.events))
    }

    fn append_batch(&self, batches: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if batches.is_empty() {
            return Ok(vec![]);
        }

        // One lock across validation and commit: either every batch lands or
        // none does, and no concurrent append can interleave.
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut validated = Vec::with_capacity(batches.len());
        for batch in &batches {
            let (key, current) = Self::validate_batch(&streams, batch)?;
            if validated.iter().any(|(k, _)| *k == key) {
                return Err(EventStoreError::InvalidAppend(
                    "duplicate stream in atomic batch".to_string(),
                ));
            }
            validated.push((key, current));
        }

        let mut committed = Vec::new();
        for (batch, (key, current)) in batches.into_iter().zip(validated) {
            committed.extend(Self::commit_batch(&mut streams, key, current, batch.events));
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn uncommitted(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.event".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({"n": 1}),
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        let first = store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(first[0].sequence_number, 1);

        let second = store
            .append(
                vec![
                    uncommitted(tenant_id, aggregate_id, "test"),
                    uncommitted(tenant_id, aggregate_id, "test"),
                ],
                ExpectedVersion::Exact(1),
            )
            .unwrap();
        assert_eq!(second[0].sequence_number, 2);
        assert_eq!(second[1].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test")],
                ExpectedVersion::Exact(0),
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn append_batch_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let stream_a = AggregateId::new();
        let stream_b = AggregateId::new();

        // Second batch carries a stale expected version; nothing may land.
        let err = store
            .append_batch(vec![
                StreamAppend {
                    events: vec![uncommitted(tenant_id, stream_a, "test")],
                    expected_version: ExpectedVersion::Exact(0),
                },
                StreamAppend {
                    events: vec![uncommitted(tenant_id, stream_b, "test")],
                    expected_version: ExpectedVersion::Exact(7),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        assert!(store.load_stream(tenant_id, stream_a).unwrap().is_empty());
        assert!(store.load_stream(tenant_id, stream_b).unwrap().is_empty());

        // A consistent batch commits everywhere.
        let committed = store
            .append_batch(vec![
                StreamAppend {
                    events: vec![uncommitted(tenant_id, stream_a, "test")],
                    expected_version: ExpectedVersion::Exact(0),
                },
                StreamAppend {
                    events: vec![uncommitted(tenant_id, stream_b, "test")],
                    expected_version: ExpectedVersion::Exact(0),
                },
            ])
            .unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(store.load_stream(tenant_id, stream_a).unwrap().len(), 1);
        assert_eq!(store.load_stream(tenant_id, stream_b).unwrap().len(), 1);
    }

    #[test]
    fn append_batch_rejects_duplicate_streams() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        let err = store
            .append_batch(vec![
                StreamAppend {
                    events: vec![uncommitted(tenant_id, aggregate_id, "test")],
                    expected_version: ExpectedVersion::Exact(0),
                },
                StreamAppend {
                    events: vec![uncommitted(tenant_id, aggregate_id, "test")],
                    expected_version: ExpectedVersion::Exact(0),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn streams_are_tenant_isolated() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        store
            .append(
                vec![uncommitted(tenant_a, aggregate_id, "test")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        assert!(store.load_stream(tenant_b, aggregate_id).unwrap().is_empty());
    }
}
