use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_catalog::{LocationId, ProductId, VariantId};
use tally_core::AggregateId;

/// Direction/category of a stock movement. Closed vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    In,
    Out,
    Transfer,
    Adjustment,
    Audit,
}

impl MovementType {
    /// Administrative movement types allowed to drive stock toward zero
    /// without the insufficiency check blocking them.
    pub fn is_administrative(self) -> bool {
        matches!(self, MovementType::Adjustment | MovementType::Audit)
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            MovementType::In => "in",
            MovementType::Out => "out",
            MovementType::Transfer => "transfer",
            MovementType::Adjustment => "adjustment",
            MovementType::Audit => "audit",
        };
        f.write_str(s)
    }
}

/// Business reason for a movement. Closed vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Purchase,
    Sale,
    Return,
    TransferIn,
    TransferOut,
    AdjustmentPositive,
    AdjustmentNegative,
    AuditCorrection,
    Damaged,
    Expired,
    Theft,
    Promotion,
    Sample,
    PurchaseOrderReceipt,
}

impl MovementReason {
    /// Loss reasons count as overrides: recording shrinkage must never be
    /// blocked by the balance it is reporting on.
    pub fn is_loss(self) -> bool {
        matches!(
            self,
            MovementReason::Damaged | MovementReason::Expired | MovementReason::Theft
        )
    }
}

/// What another subsystem may attach a movement to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    PurchaseOrder,
    SalesOrder,
    Transfer,
}

/// Polymorphic reference from a movement to its originating record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRef {
    pub kind: ReferenceKind,
    pub id: AggregateId,
}

impl MovementRef {
    pub fn purchase_order(id: AggregateId) -> Self {
        Self {
            kind: ReferenceKind::PurchaseOrder,
            id,
        }
    }
}

/// Namespace for deriving stock stream ids (UUIDv5). Never change this.
const STOCK_STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1d, 0x42, 0x6a, 0x3b, 0x77, 0x4c, 0x0e, 0x9a, 0x55, 0xd2, 0x01, 0x6e, 0xb8, 0x24, 0x7f,
]);

/// The unit of stock accounting: one ledger stream and one projection row per
/// (product, variant, location) per tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
}

impl StockKey {
    pub fn new(product_id: ProductId, location_id: LocationId) -> Self {
        Self {
            product_id,
            variant_id: None,
            location_id,
        }
    }

    pub fn with_variant(
        product_id: ProductId,
        variant_id: VariantId,
        location_id: LocationId,
    ) -> Self {
        Self {
            product_id,
            variant_id: Some(variant_id),
            location_id,
        }
    }

    /// Deterministic stream identifier for this key.
    ///
    /// UUIDv5 over the concatenated component ids, so every caller resolves
    /// the same (product, variant, location) triple to the same stream
    /// without a lookup table. The tenant is not part of the name: streams
    /// are already tenant-scoped by the store.
    pub fn stream_id(&self) -> AggregateId {
        let mut name = [0u8; 48];
        name[..16].copy_from_slice(self.product_id.0.as_uuid().as_bytes());
        if let Some(variant) = self.variant_id {
            name[16..32].copy_from_slice(variant.0.as_uuid().as_bytes());
        }
        name[32..].copy_from_slice(self.location_id.0.as_uuid().as_bytes());
        AggregateId::from_uuid(Uuid::new_v5(&STOCK_STREAM_NAMESPACE, &name))
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.variant_id {
            Some(variant) => write!(
                f,
                "{}/{}@{}",
                self.product_id, variant, self.location_id
            ),
            None => write!(f, "{}@{}", self.product_id, self.location_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::AggregateId;

    fn key() -> StockKey {
        StockKey::new(
            ProductId::new(AggregateId::new()),
            LocationId::new(AggregateId::new()),
        )
    }

    #[test]
    fn stream_id_is_deterministic() {
        let k = key();
        assert_eq!(k.stream_id(), k.stream_id());
    }

    #[test]
    fn stream_id_distinguishes_variant() {
        let k = key();
        let with_variant = StockKey {
            variant_id: Some(VariantId::new(AggregateId::new())),
            ..k
        };
        assert_ne!(k.stream_id(), with_variant.stream_id());
    }

    #[test]
    fn stream_id_distinguishes_location() {
        let k = key();
        let elsewhere = StockKey {
            location_id: LocationId::new(AggregateId::new()),
            ..k
        };
        assert_ne!(k.stream_id(), elsewhere.stream_id());
    }

    #[test]
    fn vocabulary_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&MovementType::Adjustment).unwrap(),
            "\"adjustment\""
        );
        assert_eq!(
            serde_json::to_string(&MovementReason::PurchaseOrderReceipt).unwrap(),
            "\"purchase_order_receipt\""
        );
    }
}
