use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use tally_core::TenantId;
use tally_stock::{SerialIndex, SerialIndexError, StockKey};

#[derive(Debug, Clone)]
struct SerialUnit {
    key: StockKey,
    batch_number: Option<String>,
    consumed: bool,
}

/// In-memory serial/lot index for tests/dev.
///
/// A unit is live from registration until consumption. Re-registering a
/// consumed serial revives it (a unit can come back via a return).
#[derive(Debug, Default)]
pub struct InMemorySerialIndex {
    units: RwLock<HashMap<(TenantId, String), SerialUnit>>,
}

impl InMemorySerialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, tenant_id: TenantId, serial: &str) -> bool {
        self.units
            .read()
            .map(|m| {
                m.get(&(tenant_id, serial.to_string()))
                    .map(|u| !u.consumed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn batch_of(&self, tenant_id: TenantId, serial: &str) -> Option<String> {
        self.units
            .read()
            .ok()?
            .get(&(tenant_id, serial.to_string()))
            .and_then(|u| u.batch_number.clone())
    }
}

impl SerialIndex for InMemorySerialIndex {
    fn register_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        batch_number: Option<&str>,
        serial_numbers: &[String],
        _movement_id: Uuid,
    ) -> Result<(), SerialIndexError> {
        let mut units = self
            .units
            .write()
            .map_err(|_| SerialIndexError::Unavailable("lock poisoned".to_string()))?;

        for serial in serial_numbers {
            if let Some(existing) = units.get(&(tenant_id, serial.clone())) {
                if !existing.consumed {
                    return Err(SerialIndexError::DuplicateSerial(serial.clone()));
                }
            }
        }

        for serial in serial_numbers {
            units.insert(
                (tenant_id, serial.clone()),
                SerialUnit {
                    key: *key,
                    batch_number: batch_number.map(str::to_string),
                    consumed: false,
                },
            );
        }

        Ok(())
    }

    fn consume_units(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        serial_numbers: &[String],
        _movement_id: Uuid,
    ) -> Result<(), SerialIndexError> {
        let mut units = self
            .units
            .write()
            .map_err(|_| SerialIndexError::Unavailable("lock poisoned".to_string()))?;

        for serial in serial_numbers {
            match units.get(&(tenant_id, serial.clone())) {
                Some(unit) if !unit.consumed && unit.key == *key => {}
                _ => return Err(SerialIndexError::UnknownSerial(serial.clone())),
            }
        }

        for serial in serial_numbers {
            if let Some(unit) = units.get_mut(&(tenant_id, serial.clone())) {
                unit.consumed = true;
            }
        }

        Ok(())
    }
}
