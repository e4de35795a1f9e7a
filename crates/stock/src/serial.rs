use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use tally_core::TenantId;

use crate::movement::StockKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerialIndexError {
    #[error("unknown serial number: {0}")]
    UnknownSerial(String),

    #[error("serial number already registered: {0}")]
    DuplicateSerial(String),

    #[error("serial index unavailable: {0}")]
    Unavailable(String),
}

/// Per-unit tracking keyed by serial/lot number.
///
/// The index is consulted, not owned, by the stock core: when a movement
/// carries serial numbers and an index is configured, inbound movements
/// register the units and outbound movements consume them. Ownership (and
/// persistence) belongs to whichever subsystem enables serialization.
pub trait SerialIndex: Send + Sync {
    fn register_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        batch_number: Option<&str>,
        serial_numbers: &[String],
        movement_id: Uuid,
    ) -> Result<(), SerialIndexError>;

    fn consume_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        serial_numbers: &[String],
        movement_id: Uuid,
    ) -> Result<(), SerialIndexError>;
}

impl<S> SerialIndex for Arc<S>
where
    S: SerialIndex + ?Sized,
{
    fn register_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        batch_number: Option<&str>,
        serial_numbers: &[String],
        movement_id: Uuid,
    ) -> Result<(), SerialIndexError> {
        (**self).register_units(tenant_id, key, batch_number, serial_numbers, movement_id)
    }

    fn consume_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        serial_numbers: &[String],
        movement_id: Uuid,
    ) -> Result<(), SerialIndexError> {
        (**self).consume_units(tenant_id, key, serial_numbers, movement_id)
    }
}
