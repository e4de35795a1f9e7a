use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_catalog::{LocationId, ProductId, SupplierId, VariantId};
use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use tally_events::Event;

/// Purchase order identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchase order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Pending,
    Approved,
    Shipped,
    PartiallyReceived,
    Received,
    Completed,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub const ALL: [PurchaseOrderStatus; 8] = [
        PurchaseOrderStatus::Draft,
        PurchaseOrderStatus::Pending,
        PurchaseOrderStatus::Approved,
        PurchaseOrderStatus::Shipped,
        PurchaseOrderStatus::PartiallyReceived,
        PurchaseOrderStatus::Received,
        PurchaseOrderStatus::Completed,
        PurchaseOrderStatus::Cancelled,
    ];

    /// The transition table. Adding a state means editing this table, not
    /// hunting through call sites.
    pub fn allowed_transitions(self) -> &'static [PurchaseOrderStatus] {
        use PurchaseOrderStatus::*;
        match self {
            Draft => &[Pending, Cancelled],
            Pending => &[Approved, Cancelled],
            Approved => &[Shipped, Cancelled],
            Shipped => &[Received, PartiallyReceived],
            PartiallyReceived => &[Received, Shipped],
            Received => &[Completed],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition(self, next: PurchaseOrderStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn is_receiving(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::PartiallyReceived
        )
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Pending => "pending",
            PurchaseOrderStatus::Approved => "approved",
            PurchaseOrderStatus::Shipped => "shipped",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Completed => "completed",
            PurchaseOrderStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Purchase order line item. One line per (product, variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity_ordered: i64,
    pub quantity_received: i64,
    /// Minor currency units (e.g. cents). Always positive.
    pub unit_cost: u64,
}

impl LineItem {
    pub fn line_total(&self) -> u64 {
        (self.quantity_ordered as u64).saturating_mul(self.unit_cost)
    }

    pub fn outstanding(&self) -> i64 {
        self.quantity_ordered - self.quantity_received
    }
}

/// One entry of a receipt: how much of a line arrived in this delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: i64,
}

/// A receipt entry enriched with the line's unit cost, carried on the event
/// so the stock side can value the inbound movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: i64,
    pub unit_cost: u64,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: Option<TenantId>,
    supplier_id: Option<SupplierId>,
    location_id: Option<LocationId>,
    order_number: String,
    status: PurchaseOrderStatus,
    lines: Vec<LineItem>,
    tax_amount: u64,
    shipping_amount: u64,
    ordered_at: Option<DateTime<Utc>>,
    expected_delivery_at: Option<DateTime<Utc>>,
    approved_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    last_transition_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            supplier_id: None,
            location_id: None,
            order_number: String::new(),
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            tax_amount: 0,
            shipping_amount: 0,
            ordered_at: None,
            expected_delivery_at: None,
            approved_at: None,
            shipped_at: None,
            received_at: None,
            completed_at: None,
            cancelled_at: None,
            last_transition_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn location_id(&self) -> Option<LocationId> {
        self.location_id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[LineItem] {
        &self.lines
    }

    pub fn subtotal(&self) -> u64 {
        self.lines.iter().map(LineItem::line_total).sum()
    }

    pub fn total_amount(&self) -> u64 {
        self.subtotal() + self.tax_amount + self.shipping_amount
    }

    pub fn ordered_at(&self) -> Option<DateTime<Utc>> {
        self.ordered_at
    }

    pub fn expected_delivery_at(&self) -> Option<DateTime<Utc>> {
        self.expected_delivery_at
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn line_index(&self, product_id: ProductId, variant_id: Option<VariantId>) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.product_id == product_id && l.variant_id == variant_id)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub location_id: LocationId,
    /// Human-readable, unique per tenant (uniqueness is the CRUD layer's job).
    pub order_number: String,
    pub expected_delivery_at: Option<DateTime<Utc>>,
    pub tax_amount: u64,
    pub shipping_amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLineItem (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLineItem {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity_ordered: i64,
    pub unit_cost: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransitionStatus — the single entry point for every lifecycle move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStatus {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub new_status: PurchaseOrderStatus,
    /// Per-line received quantities for this delivery. `None` on a move to
    /// `received` means "everything still outstanding arrived".
    pub received_lines: Option<Vec<ReceiptLine>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLineItem(AddLineItem),
    TransitionStatus(TransitionStatus),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub location_id: LocationId,
    pub order_number: String,
    pub expected_delivery_at: Option<DateTime<Utc>>,
    pub tax_amount: u64,
    pub shipping_amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemAdded {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity_ordered: i64,
    pub unit_cost: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub from: PurchaseOrderStatus,
    pub to: PurchaseOrderStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GoodsReceived.
///
/// Carries the per-line quantities of one delivery, enriched with unit costs,
/// so the engine can synthesize `in`/`purchase_order_receipt` movements
/// without re-reading the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub location_id: LocationId,
    pub lines: Vec<ReceivedLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    LineItemAdded(LineItemAdded),
    StatusChanged(StatusChanged),
    GoodsReceived(GoodsReceived),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::LineItemAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::StatusChanged(_) => "purchasing.order.status_changed",
            PurchaseOrderEvent::GoodsReceived(_) => "purchasing.order.goods_received",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::LineItemAdded(e) => e.occurred_at,
            PurchaseOrderEvent::StatusChanged(e) => e.occurred_at,
            PurchaseOrderEvent::GoodsReceived(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.supplier_id = Some(e.supplier_id);
                self.location_id = Some(e.location_id);
                self.order_number = e.order_number.clone();
                self.status = PurchaseOrderStatus::Draft;
                self.lines.clear();
                self.tax_amount = e.tax_amount;
                self.shipping_amount = e.shipping_amount;
                self.ordered_at = Some(e.occurred_at);
                self.expected_delivery_at = e.expected_delivery_at;
                self.last_transition_at = Some(e.occurred_at);
                self.created = true;
            }
            PurchaseOrderEvent::LineItemAdded(e) => {
                self.lines.push(LineItem {
                    line_no: e.line_no,
                    product_id: e.product_id,
                    variant_id: e.variant_id,
                    quantity_ordered: e.quantity_ordered,
                    quantity_received: 0,
                    unit_cost: e.unit_cost,
                });
            }
            PurchaseOrderEvent::StatusChanged(e) => {
                self.status = e.to;
                match e.to {
                    PurchaseOrderStatus::Approved => self.approved_at = Some(e.occurred_at),
                    PurchaseOrderStatus::Shipped => self.shipped_at = Some(e.occurred_at),
                    PurchaseOrderStatus::Received => self.received_at = Some(e.occurred_at),
                    PurchaseOrderStatus::Completed => self.completed_at = Some(e.occurred_at),
                    PurchaseOrderStatus::Cancelled => self.cancelled_at = Some(e.occurred_at),
                    _ => {}
                }
                self.last_transition_at = Some(e.occurred_at);
            }
            PurchaseOrderEvent::GoodsReceived(e) => {
                for received in &e.lines {
                    if let Some(idx) = self.line_index(received.product_id, received.variant_id) {
                        self.lines[idx].quantity_received += received.quantity;
                    }
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLineItem(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::TransitionStatus(cmd) => self.handle_transition(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePurchaseOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.order_number.trim().is_empty() {
            return Err(DomainError::validation("order number cannot be empty"));
        }
        if let Some(expected) = cmd.expected_delivery_at {
            if expected < cmd.occurred_at {
                return Err(DomainError::validation(
                    "expected delivery cannot precede the order date",
                ));
            }
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                supplier_id: cmd.supplier_id,
                location_id: cmd.location_id,
                order_number: cmd.order_number.clone(),
                expected_delivery_at: cmd.expected_delivery_at,
                tax_amount: cmd.tax_amount,
                shipping_amount: cmd.shipping_amount,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_line(&self, cmd: &AddLineItem) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invariant(
                "line items can only be added to draft purchase orders",
            ));
        }
        if cmd.quantity_ordered <= 0 {
            return Err(DomainError::validation("ordered quantity must be positive"));
        }
        if cmd.unit_cost == 0 {
            return Err(DomainError::validation("unit cost must be positive"));
        }
        if self.line_index(cmd.product_id, cmd.variant_id).is_some() {
            return Err(DomainError::conflict(
                "purchase order already has a line for this product/variant",
            ));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::LineItemAdded(LineItemAdded {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            line_no: next_line_no,
            product_id: cmd.product_id,
            variant_id: cmd.variant_id,
            quantity_ordered: cmd.quantity_ordered,
            unit_cost: cmd.unit_cost,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionStatus) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if !self.status.can_transition(cmd.new_status) {
            return Err(DomainError::invalid_transition(
                self.status.to_string(),
                cmd.new_status.to_string(),
            ));
        }

        if let Some(last) = self.last_transition_at {
            if cmd.occurred_at < last {
                return Err(DomainError::validation(
                    "transition timestamp precedes the previous lifecycle date",
                ));
            }
        }

        if cmd.new_status == PurchaseOrderStatus::Pending && self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot submit purchase order without lines",
            ));
        }

        let mut events = vec![PurchaseOrderEvent::StatusChanged(StatusChanged {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            from: self.status,
            to: cmd.new_status,
            occurred_at: cmd.occurred_at,
        })];

        if cmd.new_status.is_receiving() {
            let received = self.receipt_lines(cmd)?;
            if !received.is_empty() {
                events.push(PurchaseOrderEvent::GoodsReceived(GoodsReceived {
                    tenant_id: cmd.tenant_id,
                    order_id: cmd.order_id,
                    // Safe: a created order always has a location.
                    location_id: self.location_id.ok_or_else(|| {
                        DomainError::invariant("purchase order has no receiving location")
                    })?,
                    lines: received,
                    occurred_at: cmd.occurred_at,
                }));
            }
        } else if cmd.received_lines.is_some() {
            return Err(DomainError::validation(
                "received lines are only valid when entering a receiving status",
            ));
        }

        Ok(events)
    }

    /// Resolve the per-line quantities of this delivery.
    fn receipt_lines(&self, cmd: &TransitionStatus) -> Result<Vec<ReceivedLine>, DomainError> {
        let mut received = Vec::new();

        match &cmd.received_lines {
            Some(lines) => {
                if lines.is_empty() {
                    return Err(DomainError::validation(
                        "receipt requires at least one received line",
                    ));
                }
                // Cumulative per line, so duplicate entries cannot sneak past
                // the outstanding check.
                let mut arriving = vec![0i64; self.lines.len()];
                for entry in lines {
                    let idx = self
                        .line_index(entry.product_id, entry.variant_id)
                        .ok_or_else(|| {
                            DomainError::invalid_reference(format!(
                                "purchase order has no line for product {}",
                                entry.product_id
                            ))
                        })?;
                    let line = &self.lines[idx];
                    if entry.quantity <= 0 {
                        return Err(DomainError::validation(
                            "received quantity must be positive",
                        ));
                    }
                    arriving[idx] += entry.quantity;
                    if arriving[idx] > line.outstanding() {
                        return Err(DomainError::validation(format!(
                            "received quantity {} exceeds outstanding {} on line {}",
                            arriving[idx],
                            line.outstanding(),
                            line.line_no
                        )));
                    }
                    received.push(ReceivedLine {
                        product_id: entry.product_id,
                        variant_id: entry.variant_id,
                        quantity: entry.quantity,
                        unit_cost: line.unit_cost,
                    });
                }
            }
            None => {
                if cmd.new_status == PurchaseOrderStatus::PartiallyReceived {
                    return Err(DomainError::validation(
                        "partial receipt requires explicit received lines",
                    ));
                }
                // Full receipt: everything still outstanding arrived.
                for line in &self.lines {
                    if line.outstanding() > 0 {
                        received.push(ReceivedLine {
                            product_id: line.product_id,
                            variant_id: line.variant_id,
                            quantity: line.outstanding(),
                            unit_cost: line.unit_cost,
                        });
                    }
                }
            }
        }

        if cmd.new_status == PurchaseOrderStatus::Received {
            // After this delivery every line must be complete.
            for line in &self.lines {
                let arriving: i64 = received
                    .iter()
                    .filter(|r| r.product_id == line.product_id && r.variant_id == line.variant_id)
                    .map(|r| r.quantity)
                    .sum();
                if line.quantity_received + arriving < line.quantity_ordered {
                    return Err(DomainError::validation(format!(
                        "line {} still has outstanding quantity; use partially_received",
                        line.line_no
                    )));
                }
            }
        }

        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tally_core::AggregateId;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_supplier_id() -> SupplierId {
        SupplierId::new(AggregateId::new())
    }

    fn test_location_id() -> LocationId {
        LocationId::new(AggregateId::new())
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    struct OrderFixture {
        order: PurchaseOrder,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    }

    impl OrderFixture {
        fn new() -> Self {
            let tenant_id = test_tenant_id();
            let order_id = test_order_id();
            let mut order = PurchaseOrder::empty(order_id);

            let events = order
                .handle(&PurchaseOrderCommand::CreatePurchaseOrder(
                    CreatePurchaseOrder {
                        tenant_id,
                        order_id,
                        supplier_id: test_supplier_id(),
                        location_id: test_location_id(),
                        order_number: "PO-1001".to_string(),
                        expected_delivery_at: Some(test_time() + Duration::days(7)),
                        tax_amount: 0,
                        shipping_amount: 0,
                        occurred_at: test_time(),
                    },
                ))
                .unwrap();
            for e in &events {
                order.apply(e);
            }

            Self {
                order,
                tenant_id,
                order_id,
            }
        }

        fn add_line(&mut self, product_id: ProductId, quantity: i64, unit_cost: u64) {
            let events = self
                .order
                .handle(&PurchaseOrderCommand::AddLineItem(AddLineItem {
                    tenant_id: self.tenant_id,
                    order_id: self.order_id,
                    product_id,
                    variant_id: None,
                    quantity_ordered: quantity,
                    unit_cost,
                    occurred_at: test_time(),
                }))
                .unwrap();
            for e in &events {
                self.order.apply(e);
            }
        }

        fn transition(
            &mut self,
            new_status: PurchaseOrderStatus,
            received_lines: Option<Vec<ReceiptLine>>,
        ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
            let events = self
                .order
                .handle(&PurchaseOrderCommand::TransitionStatus(TransitionStatus {
                    tenant_id: self.tenant_id,
                    order_id: self.order_id,
                    new_status,
                    received_lines,
                    occurred_at: test_time(),
                }))?;
            for e in &events {
                self.order.apply(e);
            }
            Ok(events)
        }

        /// Force the aggregate into a status without walking the lifecycle
        /// (apply does not validate; only handle does).
        fn force_status(&mut self, status: PurchaseOrderStatus) {
            let from = self.order.status();
            self.order
                .apply(&PurchaseOrderEvent::StatusChanged(StatusChanged {
                    tenant_id: self.tenant_id,
                    order_id: self.order_id,
                    from,
                    to: status,
                    occurred_at: test_time(),
                }));
        }
    }

    #[test]
    fn create_sets_draft_status_and_order_fields() {
        let fixture = OrderFixture::new();
        assert_eq!(fixture.order.status(), PurchaseOrderStatus::Draft);
        assert_eq!(fixture.order.order_number(), "PO-1001");
        assert!(fixture.order.ordered_at().is_some());
    }

    #[test]
    fn create_rejects_empty_order_number() {
        let order = PurchaseOrder::empty(test_order_id());
        let err = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(
                CreatePurchaseOrder {
                    tenant_id: test_tenant_id(),
                    order_id: test_order_id(),
                    supplier_id: test_supplier_id(),
                    location_id: test_location_id(),
                    order_number: "  ".to_string(),
                    expected_delivery_at: None,
                    tax_amount: 0,
                    shipping_amount: 0,
                    occurred_at: test_time(),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_expected_delivery_before_order_date() {
        let order = PurchaseOrder::empty(test_order_id());
        let now = test_time();
        let err = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(
                CreatePurchaseOrder {
                    tenant_id: test_tenant_id(),
                    order_id: test_order_id(),
                    supplier_id: test_supplier_id(),
                    location_id: test_location_id(),
                    order_number: "PO-1".to_string(),
                    expected_delivery_at: Some(now - Duration::days(1)),
                    tax_amount: 0,
                    shipping_amount: 0,
                    occurred_at: now,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn transition_table_matches_the_lifecycle() {
        use PurchaseOrderStatus::*;
        assert_eq!(Draft.allowed_transitions(), &[Pending, Cancelled]);
        assert_eq!(Pending.allowed_transitions(), &[Approved, Cancelled]);
        assert_eq!(Approved.allowed_transitions(), &[Shipped, Cancelled]);
        assert_eq!(Shipped.allowed_transitions(), &[Received, PartiallyReceived]);
        assert_eq!(PartiallyReceived.allowed_transitions(), &[Received, Shipped]);
        assert_eq!(Received.allowed_transitions(), &[Completed]);
        assert!(Completed.is_terminal());
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn every_transition_outside_the_table_is_rejected() {
        for from in PurchaseOrderStatus::ALL {
            for to in PurchaseOrderStatus::ALL {
                if from.can_transition(to) {
                    continue;
                }

                let mut fixture = OrderFixture::new();
                fixture.add_line(test_product_id(), 5, 100);
                fixture.force_status(from);

                let err = fixture.transition(to, None).unwrap_err();
                match err {
                    DomainError::InvalidStatusTransition { from: f, to: t } => {
                        assert_eq!(f, from.to_string());
                        assert_eq!(t, to.to_string());
                    }
                    other => panic!("Expected InvalidStatusTransition, got {other:?}"),
                }
                assert_eq!(fixture.order.status(), from);
            }
        }
    }

    #[test]
    fn approved_cannot_jump_to_completed() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 5, 100);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();

        let err = fixture
            .transition(PurchaseOrderStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStatusTransition { .. }));
        assert_eq!(fixture.order.status(), PurchaseOrderStatus::Approved);
    }

    #[test]
    fn full_lifecycle_stamps_dates_in_order() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 5, 100);

        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Received, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Completed, None).unwrap();

        let approved = fixture.order.approved_at().unwrap();
        let received = fixture.order.received_at().unwrap();
        let completed = fixture.order.completed_at().unwrap();
        assert!(approved <= received);
        assert!(received <= completed);
        assert_eq!(fixture.order.status(), PurchaseOrderStatus::Completed);
    }

    #[test]
    fn submitting_an_empty_order_is_rejected() {
        let mut fixture = OrderFixture::new();
        let err = fixture
            .transition(PurchaseOrderStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn full_receipt_emits_goods_received_for_every_line() {
        let mut fixture = OrderFixture::new();
        let product_a = test_product_id();
        let product_b = test_product_id();
        fixture.add_line(product_a, 5, 1050);
        fixture.add_line(product_b, 3, 900);

        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        let events = fixture.transition(PurchaseOrderStatus::Received, None).unwrap();
        assert_eq!(events.len(), 2);

        match &events[1] {
            PurchaseOrderEvent::GoodsReceived(e) => {
                assert_eq!(e.lines.len(), 2);
                assert_eq!(e.lines[0].quantity, 5);
                assert_eq!(e.lines[0].unit_cost, 1050);
                assert_eq!(e.lines[1].quantity, 3);
                assert_eq!(e.lines[1].unit_cost, 900);
            }
            other => panic!("Expected GoodsReceived, got {other:?}"),
        }

        assert!(fixture.order.lines().iter().all(|l| l.outstanding() == 0));
        assert!(fixture.order.received_at().is_some());
    }

    #[test]
    fn partial_receipt_tracks_outstanding_quantities() {
        let mut fixture = OrderFixture::new();
        let product = test_product_id();
        fixture.add_line(product, 10, 500);

        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        fixture
            .transition(
                PurchaseOrderStatus::PartiallyReceived,
                Some(vec![ReceiptLine {
                    product_id: product,
                    variant_id: None,
                    quantity: 4,
                }]),
            )
            .unwrap();
        assert_eq!(fixture.order.lines()[0].quantity_received, 4);
        assert_eq!(fixture.order.lines()[0].outstanding(), 6);
        // Partial receipt does not stamp the received date.
        assert!(fixture.order.received_at().is_none());

        // The remainder arrives.
        fixture.transition(PurchaseOrderStatus::Received, None).unwrap();
        assert_eq!(fixture.order.lines()[0].outstanding(), 0);
        assert!(fixture.order.received_at().is_some());
    }

    #[test]
    fn partial_receipt_without_lines_is_rejected() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 10, 500);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        let err = fixture
            .transition(PurchaseOrderStatus::PartiallyReceived, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(fixture.order.status(), PurchaseOrderStatus::Shipped);
    }

    #[test]
    fn over_receipt_is_rejected() {
        let mut fixture = OrderFixture::new();
        let product = test_product_id();
        fixture.add_line(product, 10, 500);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        let err = fixture
            .transition(
                PurchaseOrderStatus::Received,
                Some(vec![ReceiptLine {
                    product_id: product,
                    variant_id: None,
                    quantity: 11,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn receipt_for_an_unknown_line_is_rejected() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 10, 500);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        let err = fixture
            .transition(
                PurchaseOrderStatus::Received,
                Some(vec![ReceiptLine {
                    product_id: test_product_id(),
                    variant_id: None,
                    quantity: 1,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidReference(_)));
    }

    #[test]
    fn short_explicit_receipt_cannot_claim_received() {
        let mut fixture = OrderFixture::new();
        let product = test_product_id();
        fixture.add_line(product, 10, 500);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Approved, None).unwrap();
        fixture.transition(PurchaseOrderStatus::Shipped, None).unwrap();

        let err = fixture
            .transition(
                PurchaseOrderStatus::Received,
                Some(vec![ReceiptLine {
                    product_id: product,
                    variant_id: None,
                    quantity: 4,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn duplicate_product_variant_line_is_rejected() {
        let mut fixture = OrderFixture::new();
        let product = test_product_id();
        fixture.add_line(product, 5, 100);

        let err = fixture
            .order
            .handle(&PurchaseOrderCommand::AddLineItem(AddLineItem {
                tenant_id: fixture.tenant_id,
                order_id: fixture.order_id,
                product_id: product,
                variant_id: None,
                quantity_ordered: 2,
                unit_cost: 100,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn lines_cannot_be_added_after_draft() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 5, 100);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();

        let err = fixture
            .order
            .handle(&PurchaseOrderCommand::AddLineItem(AddLineItem {
                tenant_id: fixture.tenant_id,
                order_id: fixture.order_id,
                product_id: test_product_id(),
                variant_id: None,
                quantity_ordered: 2,
                unit_cost: 100,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn rollups_are_consistent_with_line_items() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        let events = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(
                CreatePurchaseOrder {
                    tenant_id,
                    order_id,
                    supplier_id: test_supplier_id(),
                    location_id: test_location_id(),
                    order_number: "PO-7".to_string(),
                    expected_delivery_at: None,
                    tax_amount: 250,
                    shipping_amount: 1000,
                    occurred_at: test_time(),
                },
            ))
            .unwrap();
        for e in &events {
            order.apply(e);
        }

        let events = order
            .handle(&PurchaseOrderCommand::AddLineItem(AddLineItem {
                tenant_id,
                order_id,
                product_id: test_product_id(),
                variant_id: None,
                quantity_ordered: 4,
                unit_cost: 500,
                occurred_at: test_time(),
            }))
            .unwrap();
        for e in &events {
            order.apply(e);
        }

        assert_eq!(order.subtotal(), 2000);
        assert_eq!(order.total_amount(), 2000 + 250 + 1000);
    }

    #[test]
    fn transition_timestamps_must_not_regress() {
        let mut fixture = OrderFixture::new();
        fixture.add_line(test_product_id(), 5, 100);
        fixture.transition(PurchaseOrderStatus::Pending, None).unwrap();

        let err = fixture
            .order
            .handle(&PurchaseOrderCommand::TransitionStatus(TransitionStatus {
                tenant_id: fixture.tenant_id,
                order_id: fixture.order_id,
                new_status: PurchaseOrderStatus::Approved,
                received_lines: None,
                occurred_at: test_time() - Duration::days(2),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
