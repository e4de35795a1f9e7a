use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tally_catalog::{LocationId, SupplierId};
use tally_core::{AggregateId, TenantId};
use tally_events::EventEnvelope;
use tally_purchasing::{LineItem, PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderStatus};

use crate::read_model::TenantStore;

/// Aggregate type tag on purchase order envelopes.
pub const PURCHASE_ORDER_AGGREGATE_TYPE: &str = "purchasing.order";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrderReadModel {
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub location_id: LocationId,
    pub order_number: String,
    pub status: PurchaseOrderStatus,
    pub lines: Vec<LineItem>,
    pub subtotal: u64,
    pub tax_amount: u64,
    pub shipping_amount: u64,
    pub total_amount: u64,
    pub ordered_at: DateTime<Utc>,
    pub expected_delivery_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PurchaseOrderReadModel {
    fn refresh_rollups(&mut self) {
        self.subtotal = self.lines.iter().map(LineItem::line_total).sum();
        self.total_amount = self.subtotal + self.tax_amount + self.shipping_amount;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum PurchaseOrderProjectionError {
    #[error("failed to deserialize purchase order event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Purchase order projection (status, lines, rollups, lifecycle dates).
#[derive(Debug)]
pub struct PurchaseOrdersProjection<S>
where
    S: TenantStore<PurchaseOrderId, PurchaseOrderReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> PurchaseOrdersProjection<S>
where
    S: TenantStore<PurchaseOrderId, PurchaseOrderReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId, order_id: &PurchaseOrderId) -> Option<PurchaseOrderReadModel> {
        self.store.get(tenant_id, order_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<PurchaseOrderReadModel> {
        self.store.list(tenant_id)
    }

    /// Apply a committed envelope into the projection. Idempotent.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), PurchaseOrderProjectionError> {
        if envelope.aggregate_type() != PURCHASE_ORDER_AGGREGATE_TYPE {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = match self.cursors.write() {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };

        let cursor_key = CursorKey {
            tenant_id,
            aggregate_id,
        };
        let last = *cursors.get(&cursor_key).unwrap_or(&0);

        if seq == 0 {
            return Err(PurchaseOrderProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            // Gap: an earlier event is still unapplied; the caller resyncs
            // from the stream.
            return Err(PurchaseOrderProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: PurchaseOrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| PurchaseOrderProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, order_id) = match &event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => (e.tenant_id, e.order_id),
            PurchaseOrderEvent::LineItemAdded(e) => (e.tenant_id, e.order_id),
            PurchaseOrderEvent::StatusChanged(e) => (e.tenant_id, e.order_id),
            PurchaseOrderEvent::GoodsReceived(e) => (e.tenant_id, e.order_id),
        };

        if event_tenant != tenant_id {
            return Err(PurchaseOrderProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if order_id.0 != aggregate_id {
            return Err(PurchaseOrderProjectionError::TenantIsolation(
                "event order_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                let mut rm = PurchaseOrderReadModel {
                    order_id: e.order_id,
                    supplier_id: e.supplier_id,
                    location_id: e.location_id,
                    order_number: e.order_number,
                    status: PurchaseOrderStatus::Draft,
                    lines: Vec::new(),
                    subtotal: 0,
                    tax_amount: e.tax_amount,
                    shipping_amount: e.shipping_amount,
                    total_amount: 0,
                    ordered_at: e.occurred_at,
                    expected_delivery_at: e.expected_delivery_at,
                    received_at: None,
                    completed_at: None,
                };
                rm.refresh_rollups();
                self.store.upsert(tenant_id, e.order_id, rm);
            }
            PurchaseOrderEvent::LineItemAdded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.order_id) {
                    rm.lines.push(LineItem {
                        line_no: e.line_no,
                        product_id: e.product_id,
                        variant_id: e.variant_id,
                        quantity_ordered: e.quantity_ordered,
                        quantity_received: 0,
                        unit_cost: e.unit_cost,
                    });
                    rm.refresh_rollups();
                    self.store.upsert(tenant_id, e.order_id, rm);
                }
            }
            PurchaseOrderEvent::StatusChanged(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.order_id) {
                    rm.status = e.to;
                    match e.to {
                        PurchaseOrderStatus::Received => rm.received_at = Some(e.occurred_at),
                        PurchaseOrderStatus::Completed => rm.completed_at = Some(e.occurred_at),
                        _ => {}
                    }
                    self.store.upsert(tenant_id, e.order_id, rm);
                }
            }
            PurchaseOrderEvent::GoodsReceived(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.order_id) {
                    for received in &e.lines {
                        if let Some(line) = rm.lines.iter_mut().find(|l| {
                            l.product_id == received.product_id
                                && l.variant_id == received.variant_id
                        }) {
                            line.quantity_received += received.quantity;
                        }
                    }
                    self.store.upsert(tenant_id, e.order_id, rm);
                }
            }
        }

        cursors.insert(cursor_key, seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryTenantStore;
    use chrono::Utc;
    use std::sync::Arc;
    use tally_catalog::ProductId;
    use tally_purchasing::{
        GoodsReceived, LineItemAdded, PurchaseOrderCreated, ReceivedLine, StatusChanged,
    };
    use uuid::Uuid;

    fn make_envelope(
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        seq: u64,
        event: PurchaseOrderEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            order_id.0,
            PURCHASE_ORDER_AGGREGATE_TYPE.to_string(),
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    #[test]
    fn builds_the_read_model_through_the_lifecycle() {
        let proj = PurchaseOrdersProjection::new(Arc::new(InMemoryTenantStore::new()));
        let tenant_id = TenantId::new();
        let order_id = PurchaseOrderId::new(AggregateId::new());
        let product_id = ProductId::new(AggregateId::new());
        let now = Utc::now();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            order_id,
            1,
            PurchaseOrderEvent::PurchaseOrderCreated(PurchaseOrderCreated {
                tenant_id,
                order_id,
                supplier_id: SupplierId::new(AggregateId::new()),
                location_id: LocationId::new(AggregateId::new()),
                order_number: "PO-42".to_string(),
                expected_delivery_at: None,
                tax_amount: 100,
                shipping_amount: 50,
                occurred_at: now,
            }),
        ))
        .unwrap();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            order_id,
            2,
            PurchaseOrderEvent::LineItemAdded(LineItemAdded {
                tenant_id,
                order_id,
                line_no: 1,
                product_id,
                variant_id: None,
                quantity_ordered: 5,
                unit_cost: 200,
                occurred_at: now,
            }),
        ))
        .unwrap();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            order_id,
            3,
            PurchaseOrderEvent::StatusChanged(StatusChanged {
                tenant_id,
                order_id,
                from: PurchaseOrderStatus::Shipped,
                to: PurchaseOrderStatus::Received,
                occurred_at: now,
            }),
        ))
        .unwrap();

        proj.apply_envelope(&make_envelope(
            tenant_id,
            order_id,
            4,
            PurchaseOrderEvent::GoodsReceived(GoodsReceived {
                tenant_id,
                order_id,
                location_id: LocationId::new(AggregateId::new()),
                lines: vec![ReceivedLine {
                    product_id,
                    variant_id: None,
                    quantity: 5,
                    unit_cost: 200,
                }],
                occurred_at: now,
            }),
        ))
        .unwrap();

        let rm = proj.get(tenant_id, &order_id).unwrap();
        assert_eq!(rm.order_number, "PO-42");
        assert_eq!(rm.status, PurchaseOrderStatus::Received);
        assert_eq!(rm.subtotal, 1000);
        assert_eq!(rm.total_amount, 1150);
        assert_eq!(rm.lines[0].quantity_received, 5);
        assert_eq!(rm.received_at, Some(now));
    }
}
