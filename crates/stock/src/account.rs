use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, UserId};
use tally_events::Event;

use crate::movement::{MovementRef, MovementReason, MovementType, StockKey};

/// Aggregate root: the running stock balance for one key.
///
/// There is no explicit create command; the first movement for a key
/// bootstraps the stream from a zero balance. State is the minimum the
/// decision logic needs (balance + reservation); everything else a reader
/// wants (cost, timestamps) lives in the read models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAccount {
    id: AggregateId,
    key: StockKey,
    tenant_id: Option<TenantId>,
    current_stock: i64,
    reserved_stock: i64,
    version: u64,
}

impl StockAccount {
    /// Create an empty aggregate instance for rehydration.
    pub fn empty(key: StockKey) -> Self {
        Self {
            id: key.stream_id(),
            key,
            tenant_id: None,
            current_stock: 0,
            reserved_stock: 0,
            version: 0,
        }
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn current_stock(&self) -> i64 {
        self.current_stock
    }

    pub fn reserved_stock(&self) -> i64 {
        self.reserved_stock
    }

    pub fn available_stock(&self) -> i64 {
        self.current_stock - self.reserved_stock
    }
}

impl AggregateRoot for StockAccount {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RecordMovement — append one signed change to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMovement {
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub movement_id: Uuid,
    pub movement_type: MovementType,
    pub reason: MovementReason,
    pub quantity_change: i64,
    /// Minor currency units (e.g. cents).
    pub cost_per_unit: Option<u64>,
    pub reference: Option<MovementRef>,
    pub batch_number: Option<String>,
    pub serial_numbers: Vec<String>,
    pub notes: Option<String>,
    pub recorded_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock — earmark on-hand quantity without moving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub quantity: i64,
    pub reference: Option<MovementRef>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseStock — return a reservation to the available pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    RecordMovement(RecordMovement),
    ReserveStock(ReserveStock),
    ReleaseStock(ReleaseStock),
}

/// Event: MovementRecorded. Immutable fact; corrections are new events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub movement_id: Uuid,
    pub tenant_id: TenantId,
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

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub quantity: i64,
    pub reference: Option<MovementRef>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    MovementRecorded(MovementRecorded),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::MovementRecorded(_) => "stock.movement_recorded",
            StockEvent::StockReserved(_) => "stock.reserved",
            StockEvent::StockReleased(_) => "stock.released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::MovementRecorded(e) => e.occurred_at,
            StockEvent::StockReserved(e) => e.occurred_at,
            StockEvent::StockReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockAccount {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::MovementRecorded(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.key = e.key;
                // Override movements may carry a delta past zero; the balance
                // floors there. The signed delta stays in the ledger.
                self.current_stock = (self.current_stock + e.quantity_change).max(0);
                // A depletion through the reserved line consumes the reservation.
                self.reserved_stock = self.reserved_stock.min(self.current_stock);
            }
            StockEvent::StockReserved(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.reserved_stock += e.quantity;
            }
            StockEvent::StockReleased(e) => {
                self.reserved_stock = (self.reserved_stock - e.quantity).max(0);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::RecordMovement(cmd) => self.handle_record(cmd),
            StockCommand::ReserveStock(cmd) => self.handle_reserve(cmd),
            StockCommand::ReleaseStock(cmd) => self.handle_release(cmd),
        }
    }
}

impl StockAccount {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        match self.tenant_id {
            Some(existing) if existing != tenant_id => {
                Err(DomainError::invariant("tenant mismatch"))
            }
            _ => Ok(()),
        }
    }

    fn ensure_key(&self, key: StockKey) -> Result<(), DomainError> {
        if self.key != key {
            return Err(DomainError::invariant("stock key mismatch"));
        }
        Ok(())
    }

    fn handle_record(&self, cmd: &RecordMovement) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.key)?;

        if cmd.quantity_change == 0 {
            return Err(DomainError::validation("quantity change cannot be zero"));
        }

        // Direction coherence for the unambiguous types.
        match cmd.movement_type {
            MovementType::In if cmd.quantity_change < 0 => {
                return Err(DomainError::validation(
                    "inbound movement requires a positive quantity change",
                ));
            }
            MovementType::Out if cmd.quantity_change > 0 => {
                return Err(DomainError::validation(
                    "outbound movement requires a negative quantity change",
                ));
            }
            _ => {}
        }

        let is_override = cmd.movement_type.is_administrative() || cmd.reason.is_loss();
        let new_quantity = self.current_stock + cmd.quantity_change;
        if new_quantity < 0 && !is_override {
            return Err(DomainError::insufficient_stock(
                self.key.to_string(),
                self.current_stock,
                cmd.quantity_change,
            ));
        }

        Ok(vec![StockEvent::MovementRecorded(MovementRecorded {
            movement_id: cmd.movement_id,
            tenant_id: cmd.tenant_id,
            key: cmd.key,
            movement_type: cmd.movement_type,
            reason: cmd.reason,
            quantity_change: cmd.quantity_change,
            cost_per_unit: cmd.cost_per_unit,
            reference: cmd.reference,
            batch_number: cmd.batch_number.clone(),
            serial_numbers: cmd.serial_numbers.clone(),
            notes: cmd.notes.clone(),
            recorded_by: cmd.recorded_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.key)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation(
                "reservation quantity must be positive",
            ));
        }

        // Invariant: reserved_stock <= current_stock.
        if self.reserved_stock + cmd.quantity > self.current_stock {
            return Err(DomainError::insufficient_stock(
                self.key.to_string(),
                self.available_stock(),
                cmd.quantity,
            ));
        }

        Ok(vec![StockEvent::StockReserved(StockReserved {
            tenant_id: cmd.tenant_id,
            key: cmd.key,
            quantity: cmd.quantity,
            reference: cmd.reference,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.key)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("release quantity must be positive"));
        }

        if cmd.quantity > self.reserved_stock {
            return Err(DomainError::validation(
                "release exceeds reserved stock",
            ));
        }

        Ok(vec![StockEvent::StockReleased(StockReleased {
            tenant_id: cmd.tenant_id,
            key: cmd.key,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
