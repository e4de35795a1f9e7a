use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tally_core::{AggregateId, TenantId};
use tally_events::EventEnvelope;
use tally_stock::{MovementType, StockEvent, StockKey};

use crate::read_model::TenantStore;

/// Aggregate type tag on stock ledger envelopes.
pub const STOCK_AGGREGATE_TYPE: &str = "stock.account";

/// Queryable stock read model: one row per (tenant, product, variant, location).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub key: StockKey,
    pub current_stock: i64,
    pub reserved_stock: i64,
    /// current_stock - reserved_stock, recomputed on every write.
    pub available_stock: i64,
    /// Weighted-average cost in minor units. None until a costed receipt.
    pub cost_per_unit: Option<u64>,
    /// current_stock × cost_per_unit.
    pub total_cost: u64,
    pub last_movement_at: Option<DateTime<Utc>>,
    /// Stamped by audit movements.
    pub last_counted_at: Option<DateTime<Utc>>,
}

impl StockLevel {
    fn empty(key: StockKey) -> Self {
        Self {
            key,
            current_stock: 0,
            reserved_stock: 0,
            available_stock: 0,
            cost_per_unit: None,
            total_cost: 0,
            last_movement_at: None,
            last_counted_at: None,
        }
    }

    fn refresh_derived(&mut self) {
        self.available_stock = self.current_stock - self.reserved_stock;
        self.total_cost = (self.current_stock.max(0) as u64)
            .saturating_mul(self.cost_per_unit.unwrap_or(0));
    }
}

/// Tenant+aggregate cursor to support at-least-once delivery (idempotent projection).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum StockLevelProjectionError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock level projection — the single writer of the stock read model.
///
/// Consumes committed envelopes (JSON payloads) and maintains a
/// tenant-isolated read model. Rows are created on the first movement for a
/// key and soft-zeroed rather than deleted. Disposable and rebuildable from
/// the event stream.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: TenantStore<StockKey, StockLevel>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: TenantStore<StockKey, StockLevel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Query read model for one tenant/key.
    pub fn get(&self, tenant_id: TenantId, key: &StockKey) -> Option<StockLevel> {
        self.store.get(tenant_id, key)
    }

    /// List all stock levels for a tenant.
    pub fn list(&self, tenant_id: TenantId) -> Vec<StockLevel> {
        self.store.list(tenant_id)
    }

    /// Apply a committed envelope into the projection.
    ///
    /// - Enforces tenant isolation
    /// - Enforces monotonic sequence per (tenant, aggregate) stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are no-ops)
    ///
    /// Returns the updated row, or `None` when the envelope was a duplicate
    /// or not a stock event (callers use this to skip alert recomputation).
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<StockLevel>, StockLevelProjectionError> {
        if envelope.aggregate_type() != STOCK_AGGREGATE_TYPE {
            return Ok(None);
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = match self.cursors.write() {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

        let cursor_key = CursorKey {
            tenant_id,
            aggregate_id,
        };
        let last = *cursors.get(&cursor_key).unwrap_or(&0);

        if seq == 0 {
            return Err(StockLevelProjectionError::NonMonotonicSequence { last, found: seq });
        }

        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(None);
        }

        if seq != last + 1 {
            // A gap means an earlier event has not been applied yet (e.g. a
            // concurrent writer committed first but applied second). The
            // caller resyncs from the stream, which always starts at 1.
            return Err(StockLevelProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: StockEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| StockLevelProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, key) = match &event {
            StockEvent::MovementRecorded(e) => (e.tenant_id, e.key),
            StockEvent::StockReserved(e) => (e.tenant_id, e.key),
            StockEvent::StockReleased(e) => (e.tenant_id, e.key),
        };

        if event_tenant != tenant_id {
            return Err(StockLevelProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }

        if key.stream_id() != aggregate_id {
            return Err(StockLevelProjectionError::TenantIsolation(
                "event stock key does not match envelope aggregate_id".to_string(),
            ));
        }

        let mut level = self
            .store
            .get(tenant_id, &key)
            .unwrap_or_else(|| StockLevel::empty(key));

        match event {
            StockEvent::MovementRecorded(e) => {
                let old_quantity = level.current_stock;
                let new_quantity = old_quantity + e.quantity_change;

                if new_quantity < 0 {
                    // Only override movements get here; the decision step
                    // rejected everything else. Floors must be auditable, so
                    // they log distinctly from ordinary depletion.
                    tracing::warn!(
                        key = %key,
                        on_hand = old_quantity,
                        delta = e.quantity_change,
                        reason = ?e.reason,
                        "override movement floored stock at zero"
                    );
                }

                level.current_stock = new_quantity.max(0);
                level.reserved_stock = level.reserved_stock.min(level.current_stock);

                // Weighted-average cost on costed inbound quantity.
                if e.quantity_change > 0 {
                    if let Some(incoming_cost) = e.cost_per_unit {
                        level.cost_per_unit = Some(match level.cost_per_unit {
                            Some(existing) if old_quantity > 0 => {
                                let existing_value = (old_quantity as u64) * existing;
                                let incoming_value = (e.quantity_change as u64) * incoming_cost;
                                (existing_value + incoming_value)
                                    / ((old_quantity + e.quantity_change) as u64)
                            }
                            _ => incoming_cost,
                        });
                    }
                }

                level.last_movement_at = Some(e.occurred_at);
                if e.movement_type == MovementType::Audit {
                    level.last_counted_at = Some(e.occurred_at);
                }
            }
            StockEvent::StockReserved(e) => {
                level.reserved_stock += e.quantity;
            }
            StockEvent::StockReleased(e) => {
                level.reserved_stock = (level.reserved_stock - e.quantity).max(0);
            }
        }

        level.refresh_derived();
        self.store.upsert(tenant_id, key, level.clone());

        // Advance cursor after successful apply.
        cursors.insert(cursor_key, seq);

        Ok(Some(level))
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StockLevelProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();

        // Clear read model per tenant before rebuilding.
        {
            let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
            tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
            tenants.dedup();
            for t in tenants {
                self.store.clear_tenant(t);
            }
        }

        // Deterministic replay order: tenant, aggregate, sequence.
        envs.sort_by_key(|e| {
            (
                *e.tenant_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryTenantStore;
    use chrono::Utc;
    use std::sync::Arc;
    use tally_catalog::{LocationId, ProductId};
    use tally_core::AggregateId;
    use tally_stock::{MovementReason, MovementRecorded};
    use uuid::Uuid;

    fn test_key() -> StockKey {
        StockKey::new(
            ProductId::new(AggregateId::new()),
            LocationId::new(AggregateId::new()),
        )
    }

    fn movement_event(
        tenant_id: TenantId,
        key: StockKey,
        movement_type: MovementType,
        reason: MovementReason,
        delta: i64,
        cost: Option<u64>,
    ) -> StockEvent {
        StockEvent::MovementRecorded(MovementRecorded {
            movement_id: Uuid::now_v7(),
            tenant_id,
            key,
            movement_type,
            reason,
            quantity_change: delta,
            cost_per_unit: cost,
            reference: None,
            batch_number: None,
            serial_numbers: vec![],
            notes: None,
            recorded_by: None,
            occurred_at: Utc::now(),
        })
    }

    fn make_envelope(
        tenant_id: TenantId,
        key: StockKey,
        seq: u64,
        event: StockEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            key.stream_id(),
            STOCK_AGGREGATE_TYPE.to_string(),
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn setup() -> StockLevelsProjection<Arc<InMemoryTenantStore<StockKey, StockLevel>>> {
        StockLevelsProjection::new(Arc::new(InMemoryTenantStore::new()))
    }

    #[test]
    fn first_movement_creates_the_row() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        let updated = proj
            .apply_envelope(&make_envelope(
                tenant_id,
                key,
                1,
                movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 100, Some(1050)),
            ))
            .unwrap()
            .unwrap();

        assert_eq!(updated.current_stock, 100);
        assert_eq!(updated.available_stock, 100);
        assert_eq!(updated.cost_per_unit, Some(1050));
        assert_eq!(updated.total_cost, 100 * 1050);
        assert!(updated.last_movement_at.is_some());
        assert!(updated.last_counted_at.is_none());
    }

    #[test]
    fn weighted_average_cost_over_two_receipts() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            key,
            1,
            movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 100, Some(1050)),
        ))
        .unwrap();

        let updated = proj
            .apply_envelope(&make_envelope(
                tenant_id,
                key,
                2,
                movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 50, Some(1200)),
            ))
            .unwrap()
            .unwrap();

        // (100*1050 + 50*1200) / 150 = 1100
        assert_eq!(updated.cost_per_unit, Some(1100));
        assert_eq!(updated.total_cost, 150 * 1100);
    }

    #[test]
    fn outbound_movement_keeps_the_cost_basis() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            key,
            1,
            movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 10, Some(500)),
        ))
        .unwrap();

        let updated = proj
            .apply_envelope(&make_envelope(
                tenant_id,
                key,
                2,
                movement_event(tenant_id, key, MovementType::Out, MovementReason::Sale, -4, None),
            ))
            .unwrap()
            .unwrap();

        assert_eq!(updated.current_stock, 6);
        assert_eq!(updated.cost_per_unit, Some(500));
        assert_eq!(updated.total_cost, 6 * 500);
    }

    #[test]
    fn audit_movement_stamps_last_counted_at() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        let updated = proj
            .apply_envelope(&make_envelope(
                tenant_id,
                key,
                1,
                movement_event(tenant_id, key, MovementType::Audit, MovementReason::AuditCorrection, 7, None),
            ))
            .unwrap()
            .unwrap();

        assert!(updated.last_counted_at.is_some());
    }

    #[test]
    fn override_floor_soft_zeroes_the_row() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            key,
            1,
            movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 5, None),
        ))
        .unwrap();

        let updated = proj
            .apply_envelope(&make_envelope(
                tenant_id,
                key,
                2,
                movement_event(
                    tenant_id,
                    key,
                    MovementType::Adjustment,
                    MovementReason::AdjustmentNegative,
                    -9,
                    None,
                ),
            ))
            .unwrap()
            .unwrap();

        assert_eq!(updated.current_stock, 0);
        // The row survives at zero; it is never deleted.
        assert!(proj.get(tenant_id, &key).is_some());
    }

    #[test]
    fn duplicate_envelopes_are_no_ops() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        let env = make_envelope(
            tenant_id,
            key,
            1,
            movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 10, None),
        );

        assert!(proj.apply_envelope(&env).unwrap().is_some());
        assert!(proj.apply_envelope(&env).unwrap().is_none());
        assert_eq!(proj.get(tenant_id, &key).unwrap().current_stock, 10);
    }

    #[test]
    fn rebuild_reproduces_current_state() {
        let proj = setup();
        let tenant_id = TenantId::new();
        let key = test_key();

        let envelopes = vec![
            make_envelope(
                tenant_id,
                key,
                1,
                movement_event(tenant_id, key, MovementType::In, MovementReason::Purchase, 100, Some(1050)),
            ),
            make_envelope(
                tenant_id,
                key,
                2,
                movement_event(tenant_id, key, MovementType::Out, MovementReason::Sale, -97, None),
            ),
        ];

        for env in &envelopes {
            proj.apply_envelope(env).unwrap();
        }
        let live = proj.get(tenant_id, &key).unwrap();

        proj.rebuild_from_scratch(envelopes).unwrap();
        let rebuilt = proj.get(tenant_id, &key).unwrap();

        assert_eq!(live, rebuilt);
        assert_eq!(rebuilt.current_stock, 3);
    }
}
