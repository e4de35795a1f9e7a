use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tally_catalog::{CatalogDirectory, LocationId, ProductId, SupplierId, VariantId};
use tally_core::TenantId;

/// In-memory catalog directory for tests/dev.
///
/// Production wires the CRUD layer's own catalog behind the same trait; this
/// stub only knows what has been registered on it.
#[derive(Debug, Default)]
pub struct InMemoryCatalogDirectory {
    /// Product → configured minimum stock level (None: monitored with the default).
    products: RwLock<HashMap<(TenantId, ProductId), Option<i64>>>,
    variants: RwLock<HashSet<(TenantId, ProductId, VariantId)>>,
    locations: RwLock<HashSet<(TenantId, LocationId)>>,
    suppliers: RwLock<HashSet<(TenantId, SupplierId)>>,
}

impl InMemoryCatalogDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        min_stock_level: Option<i64>,
    ) {
        if let Ok(mut map) = self.products.write() {
            map.insert((tenant_id, product_id), min_stock_level);
        }
    }

    pub fn register_variant(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: VariantId,
    ) {
        if let Ok(mut set) = self.variants.write() {
            set.insert((tenant_id, product_id, variant_id));
        }
    }

    pub fn register_location(&self, tenant_id: TenantId, location_id: LocationId) {
        if let Ok(mut set) = self.locations.write() {
            set.insert((tenant_id, location_id));
        }
    }

    pub fn register_supplier(&self, tenant_id: TenantId, supplier_id: SupplierId) {
        if let Ok(mut set) = self.suppliers.write() {
            set.insert((tenant_id, supplier_id));
        }
    }
}

impl CatalogDirectory for InMemoryCatalogDirectory {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        self.products
            .read()
            .map(|m| m.contains_key(&(tenant_id, product_id)))
            .unwrap_or(false)
    }

    fn variant_exists(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: VariantId,
    ) -> bool {
        self.variants
            .read()
            .map(|s| s.contains(&(tenant_id, product_id, variant_id)))
            .unwrap_or(false)
    }

    fn location_exists(&self, tenant_id: TenantId, location_id: LocationId) -> bool {
        self.locations
            .read()
            .map(|s| s.contains(&(tenant_id, location_id)))
            .unwrap_or(false)
    }

    fn supplier_exists(&self, tenant_id: TenantId, supplier_id: SupplierId) -> bool {
        self.suppliers
            .read()
            .map(|s| s.contains(&(tenant_id, supplier_id)))
            .unwrap_or(false)
    }

    fn min_stock_level(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        _variant_id: Option<VariantId>,
    ) -> Option<i64> {
        self.products
            .read()
            .ok()
            .and_then(|m| m.get(&(tenant_id, product_id)).copied())
            .flatten()
    }
}
