//! The stock engine: the one entry point other subsystems call.
//!
//! Everything here runs synchronously inside the caller's request: decide
//! against the rehydrated stream, append, apply the read models, recompute
//! alerts, publish. There is no background worker; the event bus is a
//! post-commit fan-out for external consumers only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use tally_catalog::{CatalogDirectory, LocationId, ProductId, SupplierId, VariantId};
use tally_core::{Aggregate, DomainError, ExpectedVersion, TenantId, UserId};
use tally_events::{EventBus, EventEnvelope};
use tally_purchasing::{
    AddLineItem, CreatePurchaseOrder, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent,
    PurchaseOrderId, PurchaseOrderStatus, ReceiptLine, TransitionStatus,
};
use tally_stock::{
    MovementRecorded, MovementRef, MovementReason, MovementType, RecordMovement, ReferenceKind,
    ReleaseStock, ReserveStock, SerialIndex, StockAccount, StockCommand, StockEvent, StockKey,
};

use crate::command_dispatcher::{
    CommandDispatcher, DispatchError, apply_history, stream_version, validate_loaded_stream,
};
use crate::config::EngineConfig;
use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
use crate::projections::low_stock_alerts::{LowStockAlert, LowStockAlertFilter, LowStockAlertsProjection};
use crate::projections::purchase_orders::{
    PURCHASE_ORDER_AGGREGATE_TYPE, PurchaseOrderProjectionError, PurchaseOrderReadModel,
    PurchaseOrdersProjection,
};
use crate::projections::stock_levels::{
    STOCK_AGGREGATE_TYPE, StockLevel, StockLevelProjectionError, StockLevelsProjection,
};
use crate::read_model::InMemoryTenantStore;

/// Boundary error taxonomy.
///
/// `Contention` is the only retryable class; everything else is permanent for
/// the given input.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient stock for {key}: on hand {on_hand}, requested {requested}")]
    StockInsufficient {
        key: String,
        on_hand: i64,
        requested: i64,
    },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("contention: {0}")]
    Contention(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Callers may retry `Contention` with backoff; nothing else.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Contention(_))
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Concurrency(msg) => EngineError::Contention(msg),
            DispatchError::InsufficientStock {
                key,
                on_hand,
                requested,
            } => EngineError::StockInsufficient {
                key,
                on_hand,
                requested,
            },
            DispatchError::InvalidReference(msg) => EngineError::InvalidReference(msg),
            DispatchError::InvalidStatusTransition { from, to } => {
                EngineError::InvalidStatusTransition { from, to }
            }
            DispatchError::Validation(msg) | DispatchError::InvariantViolation(msg) => {
                EngineError::Validation(msg)
            }
            DispatchError::Unauthorized => EngineError::Validation("unauthorized".to_string()),
            DispatchError::NotFound => EngineError::NotFound,
            DispatchError::TenantIsolation(msg) | DispatchError::Deserialize(msg) => {
                EngineError::Storage(msg)
            }
            DispatchError::Store(err) => EngineError::from(err),
            DispatchError::Publish(msg) => EngineError::Storage(format!(
                "events committed but publication failed: {msg}"
            )),
        }
    }
}

impl From<EventStoreError> for EngineError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => EngineError::Contention(msg),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::from(DispatchError::from(value))
    }
}

/// Request to append one movement to the ledger.
#[derive(Debug, Clone)]
pub struct AppendMovement {
    pub key: StockKey,
    pub movement_type: MovementType,
    pub reason: MovementReason,
    pub quantity_change: i64,
    pub cost_per_unit: Option<u64>,
    pub reference: Option<MovementRef>,
    pub batch_number: Option<String>,
    pub serial_numbers: Vec<String>,
    pub notes: Option<String>,
    pub recorded_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Request to open a purchase order.
#[derive(Debug, Clone)]
pub struct NewPurchaseOrder {
    pub supplier_id: SupplierId,
    pub location_id: LocationId,
    pub order_number: String,
    pub expected_delivery_at: Option<DateTime<Utc>>,
    pub tax_amount: u64,
    pub shipping_amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Request to add a line to a draft purchase order.
#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity_ordered: i64,
    pub unit_cost: u64,
    pub occurred_at: DateTime<Utc>,
}

type StockLevelStore = Arc<InMemoryTenantStore<StockKey, StockLevel>>;
type AlertStore = Arc<InMemoryTenantStore<StockKey, LowStockAlert>>;
type OrderStore = Arc<InMemoryTenantStore<PurchaseOrderId, PurchaseOrderReadModel>>;

/// The stock engine.
///
/// Owns the stock level and low-stock alert read models exclusively: they are
/// written only on this type's apply path, never by any other code.
pub struct StockEngine<S, B> {
    store: S,
    bus: B,
    dispatcher: CommandDispatcher<S, B>,
    catalog: Arc<dyn CatalogDirectory>,
    serial_index: Option<Arc<dyn SerialIndex>>,
    stock_levels: StockLevelsProjection<StockLevelStore>,
    alerts: LowStockAlertsProjection<AlertStore>,
    purchase_orders: PurchaseOrdersProjection<OrderStore>,
}

impl<S, B> StockEngine<S, B>
where
    S: EventStore + Clone,
    B: EventBus<EventEnvelope<JsonValue>> + Clone,
{
    pub fn new(store: S, bus: B, catalog: Arc<dyn CatalogDirectory>, config: EngineConfig) -> Self {
        let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
        let stock_levels = StockLevelsProjection::new(Arc::new(InMemoryTenantStore::new()));
        let alerts = LowStockAlertsProjection::new(
            Arc::new(InMemoryTenantStore::new()),
            catalog.clone(),
            config.default_low_stock_threshold,
            config.alert_cooldown(),
        );
        let purchase_orders = PurchaseOrdersProjection::new(Arc::new(InMemoryTenantStore::new()));

        Self {
            store,
            bus,
            dispatcher,
            catalog,
            serial_index: None,
            stock_levels,
            alerts,
            purchase_orders,
        }
    }

    /// Enable per-unit serial/lot tracking through the given index.
    pub fn with_serial_index(mut self, serial_index: Arc<dyn SerialIndex>) -> Self {
        self.serial_index = Some(serial_index);
        self
    }
}

impl<S, B> StockEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    // ---- Movement ledger ---------------------------------------------------

    /// Append one movement to the ledger and apply its projection effects.
    ///
    /// On return the event is durable, the stock level row reflects it, and
    /// the alert row has been recomputed.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, key = %request.key), err)]
    pub fn append_movement(
        &self,
        tenant_id: TenantId,
        request: AppendMovement,
    ) -> Result<MovementRecorded, EngineError> {
        self.validate_movement_refs(tenant_id, &request)?;

        let key = request.key;
        let command = RecordMovement {
            tenant_id,
            key,
            movement_id: Uuid::now_v7(),
            movement_type: request.movement_type,
            reason: request.reason,
            quantity_change: request.quantity_change,
            cost_per_unit: request.cost_per_unit,
            reference: request.reference,
            batch_number: request.batch_number,
            serial_numbers: request.serial_numbers,
            notes: request.notes,
            recorded_by: request.recorded_by,
            occurred_at: request.occurred_at,
        };

        let serial_undo = self.consult_serial_index(tenant_id, &command)?;

        let committed = match self.dispatcher.dispatch(
            tenant_id,
            key.stream_id(),
            STOCK_AGGREGATE_TYPE,
            StockCommand::RecordMovement(command.clone()),
            |_, _| StockAccount::empty(key),
        ) {
            Ok(committed) => committed,
            Err(err) => {
                self.undo_serial_op(tenant_id, &command, serial_undo);
                return Err(err.into());
            }
        };

        self.apply_committed(&committed)?;

        tracing::debug!(
            tenant_id = %tenant_id,
            %key,
            delta = command.quantity_change,
            reason = ?command.reason,
            "movement recorded"
        );

        extract_movement(&committed).ok_or_else(|| {
            EngineError::Storage("committed batch is missing the movement event".to_string())
        })
    }

    /// Earmark on-hand stock. `reserved + quantity` may not exceed the
    /// current balance.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, key = %key), err)]
    pub fn reserve_stock(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        quantity: i64,
        reference: Option<MovementRef>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.validate_key_refs(tenant_id, &key)?;

        let committed = self
            .dispatcher
            .dispatch(
                tenant_id,
                key.stream_id(),
                STOCK_AGGREGATE_TYPE,
                StockCommand::ReserveStock(ReserveStock {
                    tenant_id,
                    key,
                    quantity,
                    reference,
                    occurred_at,
                }),
                |_, _| StockAccount::empty(key),
            )
            .map_err(EngineError::from)?;

        self.apply_committed(&committed)
    }

    /// Return previously reserved stock to the available pool.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, key = %key), err)]
    pub fn release_stock(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        quantity: i64,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let committed = self
            .dispatcher
            .dispatch(
                tenant_id,
                key.stream_id(),
                STOCK_AGGREGATE_TYPE,
                StockCommand::ReleaseStock(ReleaseStock {
                    tenant_id,
                    key,
                    quantity,
                    occurred_at,
                }),
                |_, _| StockAccount::empty(key),
            )
            .map_err(EngineError::from)?;

        self.apply_committed(&committed)
    }

    // ---- Purchase order workflow ------------------------------------------

    #[instrument(skip(self, request), fields(tenant_id = %tenant_id), err)]
    pub fn create_purchase_order(
        &self,
        tenant_id: TenantId,
        request: NewPurchaseOrder,
    ) -> Result<PurchaseOrderId, EngineError> {
        if !self.catalog.supplier_exists(tenant_id, request.supplier_id) {
            return Err(EngineError::InvalidReference(format!(
                "unknown supplier {}",
                request.supplier_id
            )));
        }
        if !self.catalog.location_exists(tenant_id, request.location_id) {
            return Err(EngineError::InvalidReference(format!(
                "unknown location {}",
                request.location_id
            )));
        }

        let order_id = PurchaseOrderId::new(tally_core::AggregateId::new());
        let committed = self
            .dispatcher
            .dispatch(
                tenant_id,
                order_id.0,
                PURCHASE_ORDER_AGGREGATE_TYPE,
                PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                    tenant_id,
                    order_id,
                    supplier_id: request.supplier_id,
                    location_id: request.location_id,
                    order_number: request.order_number,
                    expected_delivery_at: request.expected_delivery_at,
                    tax_amount: request.tax_amount,
                    shipping_amount: request.shipping_amount,
                    occurred_at: request.occurred_at,
                }),
                |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
            )
            .map_err(EngineError::from)?;

        self.apply_committed(&committed)?;
        Ok(order_id)
    }

    #[instrument(skip(self, line), fields(tenant_id = %tenant_id, order_id = %order_id), err)]
    pub fn add_purchase_order_line(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        line: NewOrderLine,
    ) -> Result<(), EngineError> {
        if !self.catalog.product_exists(tenant_id, line.product_id) {
            return Err(EngineError::InvalidReference(format!(
                "unknown product {}",
                line.product_id
            )));
        }
        if let Some(variant_id) = line.variant_id {
            if !self.catalog.variant_exists(tenant_id, line.product_id, variant_id) {
                return Err(EngineError::InvalidReference(format!(
                    "unknown variant {variant_id}"
                )));
            }
        }

        let committed = self
            .dispatcher
            .dispatch(
                tenant_id,
                order_id.0,
                PURCHASE_ORDER_AGGREGATE_TYPE,
                PurchaseOrderCommand::AddLineItem(AddLineItem {
                    tenant_id,
                    order_id,
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    quantity_ordered: line.quantity_ordered,
                    unit_cost: line.unit_cost,
                    occurred_at: line.occurred_at,
                }),
                |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
            )
            .map_err(EngineError::from)?;

        self.apply_committed(&committed)
    }

    /// Move a purchase order through its lifecycle.
    ///
    /// Entering `received`/`partially_received` synthesizes one
    /// `in`/`purchase_order_receipt` movement per received line, appended in
    /// the SAME atomic batch as the status change: a failure on any line
    /// aborts the whole transition. Returns the synthesized movements.
    #[instrument(
        skip(self, received_lines),
        fields(tenant_id = %tenant_id, order_id = %order_id, new_status = %new_status),
        err
    )]
    pub fn transition_purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        new_status: PurchaseOrderStatus,
        received_lines: Option<Vec<ReceiptLine>>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<MovementRecorded>, EngineError> {
        // Rehydrate the order.
        let history = self.store.load_stream(tenant_id, order_id.0)?;
        if history.is_empty() {
            return Err(EngineError::NotFound);
        }
        validate_loaded_stream(tenant_id, order_id.0, &history).map_err(EngineError::from)?;
        let order_version = stream_version(&history);
        let mut order = PurchaseOrder::empty(order_id);
        apply_history::<PurchaseOrder>(&mut order, &history).map_err(EngineError::from)?;

        // Decide the transition.
        let order_events = order
            .handle(&PurchaseOrderCommand::TransitionStatus(TransitionStatus {
                tenant_id,
                order_id,
                new_status,
                received_lines,
                occurred_at,
            }))
            .map_err(EngineError::from)?;

        // Decide the receipt movements (one ledger stream per stock key).
        let mut movements = Vec::new();
        let mut stock_batches: Vec<StreamAppend> = Vec::new();
        for event in &order_events {
            let PurchaseOrderEvent::GoodsReceived(receipt) = event else {
                continue;
            };
            for line in &receipt.lines {
                let key = match line.variant_id {
                    Some(variant_id) => {
                        StockKey::with_variant(line.product_id, variant_id, receipt.location_id)
                    }
                    None => StockKey::new(line.product_id, receipt.location_id),
                };
                self.validate_key_refs(tenant_id, &key)?;

                let command = RecordMovement {
                    tenant_id,
                    key,
                    movement_id: Uuid::now_v7(),
                    movement_type: MovementType::In,
                    reason: MovementReason::PurchaseOrderReceipt,
                    quantity_change: line.quantity,
                    cost_per_unit: Some(line.unit_cost),
                    reference: Some(MovementRef::purchase_order(order_id.0)),
                    batch_number: None,
                    serial_numbers: vec![],
                    notes: None,
                    recorded_by: None,
                    occurred_at: receipt.occurred_at,
                };

                let stream_history = self.store.load_stream(tenant_id, key.stream_id())?;
                validate_loaded_stream(tenant_id, key.stream_id(), &stream_history)
                    .map_err(EngineError::from)?;
                let mut account = StockAccount::empty(key);
                apply_history::<StockAccount>(&mut account, &stream_history)
                    .map_err(EngineError::from)?;

                let decided = account
                    .handle(&StockCommand::RecordMovement(command))
                    .map_err(EngineError::from)?;

                let uncommitted = decided
                    .iter()
                    .map(|ev| {
                        UncommittedEvent::from_typed(
                            tenant_id,
                            key.stream_id(),
                            STOCK_AGGREGATE_TYPE,
                            Uuid::now_v7(),
                            ev,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                for ev in &decided {
                    if let StockEvent::MovementRecorded(m) = ev {
                        movements.push(m.clone());
                    }
                }

                stock_batches.push(StreamAppend {
                    events: uncommitted,
                    expected_version: ExpectedVersion::Exact(stream_version(&stream_history)),
                });
            }
        }

        // Status change + receipts commit together or not at all.
        let order_uncommitted = order_events
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    order_id.0,
                    PURCHASE_ORDER_AGGREGATE_TYPE,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut batches = vec![StreamAppend {
            events: order_uncommitted,
            expected_version: ExpectedVersion::Exact(order_version),
        }];
        batches.extend(stock_batches);

        let committed = self.store.append_batch(batches)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| EngineError::Storage(format!("publication failed: {e:?}")))?;
        }

        self.apply_committed(&committed)?;

        tracing::info!(
            tenant_id = %tenant_id,
            order_id = %order_id,
            %new_status,
            receipt_movements = movements.len(),
            "purchase order transitioned"
        );

        Ok(movements)
    }

    // ---- Read accessors ----------------------------------------------------

    pub fn get_stock_level(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
    ) -> Option<StockLevel> {
        let key = StockKey {
            product_id,
            variant_id,
            location_id,
        };
        self.stock_levels.get(tenant_id, &key)
    }

    pub fn list_stock_levels(&self, tenant_id: TenantId) -> Vec<StockLevel> {
        self.stock_levels.list(tenant_id)
    }

    pub fn list_low_stock_alerts(
        &self,
        tenant_id: TenantId,
        filter: &LowStockAlertFilter,
    ) -> Vec<LowStockAlert> {
        self.alerts.list(tenant_id, filter)
    }

    pub fn get_purchase_order(
        &self,
        tenant_id: TenantId,
        order_id: &PurchaseOrderId,
    ) -> Option<PurchaseOrderReadModel> {
        self.purchase_orders.get(tenant_id, order_id)
    }

    // ---- Internals ---------------------------------------------------------

    /// Apply committed events to the read models this engine owns.
    ///
    /// Stock envelopes update the stock level row and then recompute the
    /// alert row for that key; purchase order envelopes update the order read
    /// model. Projections are idempotent, so replays are harmless.
    fn apply_committed(&self, committed: &[StoredEvent]) -> Result<(), EngineError> {
        for stored in committed {
            let envelope = stored.to_envelope();
            match stored.aggregate_type.as_str() {
                STOCK_AGGREGATE_TYPE => {
                    match self.stock_levels.apply_envelope(&envelope) {
                        Ok(Some(level)) => {
                            self.alerts
                                .recompute(stored.tenant_id, &level, stored.occurred_at);
                        }
                        Ok(None) => {}
                        Err(StockLevelProjectionError::NonMonotonicSequence { .. }) => {
                            // A concurrent writer committed an earlier event
                            // and has not applied it yet; replay the stream.
                            self.resync_stock_stream(stored.tenant_id, stored.aggregate_id)?;
                        }
                        Err(e) => return Err(EngineError::Storage(e.to_string())),
                    }
                }
                PURCHASE_ORDER_AGGREGATE_TYPE => {
                    match self.purchase_orders.apply_envelope(&envelope) {
                        Ok(()) => {}
                        Err(PurchaseOrderProjectionError::NonMonotonicSequence { .. }) => {
                            self.resync_order_stream(stored.tenant_id, stored.aggregate_id)?;
                        }
                        Err(e) => return Err(EngineError::Storage(e.to_string())),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replay a stock stream into the projection after an apply gap.
    ///
    /// Duplicate envelopes are no-ops, so replaying the whole stream is safe
    /// and converges even when the racing writer applies concurrently.
    fn resync_stock_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: tally_core::AggregateId,
    ) -> Result<(), EngineError> {
        let stream = self.store.load_stream(tenant_id, aggregate_id)?;
        let mut latest: Option<(StockLevel, DateTime<Utc>)> = None;
        for stored in &stream {
            match self.stock_levels.apply_envelope(&stored.to_envelope()) {
                Ok(Some(level)) => latest = Some((level, stored.occurred_at)),
                Ok(None) => {}
                Err(e) => return Err(EngineError::Storage(e.to_string())),
            }
        }
        if let Some((level, as_of)) = latest {
            self.alerts.recompute(tenant_id, &level, as_of);
        }
        Ok(())
    }

    /// Replay a purchase order stream into the projection after an apply gap.
    fn resync_order_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: tally_core::AggregateId,
    ) -> Result<(), EngineError> {
        let stream = self.store.load_stream(tenant_id, aggregate_id)?;
        for stored in &stream {
            self.purchase_orders
                .apply_envelope(&stored.to_envelope())
                .map_err(|e| EngineError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn validate_movement_refs(
        &self,
        tenant_id: TenantId,
        request: &AppendMovement,
    ) -> Result<(), EngineError> {
        self.validate_key_refs(tenant_id, &request.key)?;

        if let Some(reference) = &request.reference {
            if reference.kind == ReferenceKind::PurchaseOrder {
                let stream = self.store.load_stream(tenant_id, reference.id)?;
                if stream.is_empty() {
                    return Err(EngineError::InvalidReference(format!(
                        "unknown purchase order {}",
                        reference.id
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_key_refs(&self, tenant_id: TenantId, key: &StockKey) -> Result<(), EngineError> {
        if !self.catalog.product_exists(tenant_id, key.product_id) {
            return Err(EngineError::InvalidReference(format!(
                "unknown product {}",
                key.product_id
            )));
        }
        if let Some(variant_id) = key.variant_id {
            if !self.catalog.variant_exists(tenant_id, key.product_id, variant_id) {
                return Err(EngineError::InvalidReference(format!(
                    "unknown variant {variant_id}"
                )));
            }
        }
        if !self.catalog.location_exists(tenant_id, key.location_id) {
            return Err(EngineError::InvalidReference(format!(
                "unknown location {}",
                key.location_id
            )));
        }
        Ok(())
    }

    /// Consult the serial index before appending, when one is configured and
    /// the movement names serial numbers. Returns which direction was applied
    /// so a failed append can be compensated.
    fn consult_serial_index(
        &self,
        tenant_id: TenantId,
        command: &RecordMovement,
    ) -> Result<Option<SerialOp>, EngineError> {
        let Some(index) = &self.serial_index else {
            return Ok(None);
        };
        if command.serial_numbers.is_empty() {
            return Ok(None);
        }

        let op = if command.quantity_change > 0 {
            index
                .register_units(
                    tenant_id,
                    &command.key,
                    command.batch_number.as_deref(),
                    &command.serial_numbers,
                    command.movement_id,
                )
                .map_err(|e| EngineError::Validation(e.to_string()))?;
            SerialOp::Registered
        } else {
            index
                .consume_units(
                    tenant_id,
                    &command.key,
                    &command.serial_numbers,
                    command.movement_id,
                )
                .map_err(|e| EngineError::InvalidReference(e.to_string()))?;
            SerialOp::Consumed
        };

        Ok(Some(op))
    }

    /// Compensate a serial index operation after the append failed.
    fn undo_serial_op(&self, tenant_id: TenantId, command: &RecordMovement, op: Option<SerialOp>) {
        let (Some(index), Some(op)) = (&self.serial_index, op) else {
            return;
        };

        let result = match op {
            SerialOp::Registered => index.consume_units(
                tenant_id,
                &command.key,
                &command.serial_numbers,
                command.movement_id,
            ),
            SerialOp::Consumed => index.register_units(
                tenant_id,
                &command.key,
                command.batch_number.as_deref(),
                &command.serial_numbers,
                command.movement_id,
            ),
        };

        if let Err(err) = result {
            tracing::warn!(
                tenant_id = %tenant_id,
                key = %command.key,
                error = %err,
                "failed to compensate serial index after aborted append"
            );
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum SerialOp {
    Registered,
    Consumed,
}

fn extract_movement(committed: &[StoredEvent]) -> Option<MovementRecorded> {
    for stored in committed {
        if let Ok(StockEvent::MovementRecorded(movement)) =
            serde_json::from_value::<StockEvent>(stored.payload.clone())
        {
            return Some(movement);
        }
    }
    None
}
