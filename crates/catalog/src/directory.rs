use std::sync::Arc;

use tally_core::TenantId;

use crate::ids::{LocationId, ProductId, SupplierId, VariantId};

/// Read-only view of the catalog, owned by the surrounding CRUD layer.
///
/// The stock core consults it for reference validation (a movement naming an
/// unknown product or location is rejected) and for the low-stock threshold
/// of a monitored product. Implementations must scope every lookup to the
/// given tenant.
pub trait CatalogDirectory: Send + Sync {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool;

    fn variant_exists(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: VariantId,
    ) -> bool;

    fn location_exists(&self, tenant_id: TenantId, location_id: LocationId) -> bool;

    fn supplier_exists(&self, tenant_id: TenantId, supplier_id: SupplierId) -> bool;

    /// Configured minimum stock level for a product (or variant), if any.
    ///
    /// `None` means the product is monitored with the engine-wide default
    /// threshold rather than a product-specific one.
    fn min_stock_level(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Option<i64>;
}

impl<D> CatalogDirectory for Arc<D>
where
    D: CatalogDirectory + ?Sized,
{
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        (**self).product_exists(tenant_id, product_id)
    }

    fn variant_exists(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: VariantId,
    ) -> bool {
        (**self).variant_exists(tenant_id, product_id, variant_id)
    }

    fn location_exists(&self, tenant_id: TenantId, location_id: LocationId) -> bool {
        (**self).location_exists(tenant_id, location_id)
    }

    fn supplier_exists(&self, tenant_id: TenantId, supplier_id: SupplierId) -> bool {
        (**self).supplier_exists(tenant_id, supplier_id)
    }

    fn min_stock_level(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Option<i64> {
        (**self).min_stock_level(tenant_id, product_id, variant_id)
    }
}
