use tally_core::TenantId;

use crate::EventEnvelope;

/// Helper trait for tenant-scoped messages.
///
/// Marks types that carry an associated tenant ID, enabling tenant-aware
/// processing in infrastructure components (subscription loops, message
/// filtering, defense-in-depth validation).
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id()
    }
}
