use chrono::{DateTime, Duration, Utc};

use tally_catalog::{CatalogDirectory, LocationId, ProductId};
use tally_core::TenantId;
use tally_stock::StockKey;

use crate::projections::stock_levels::StockLevel;
use crate::read_model::TenantStore;

/// Derived monitoring state for one stock key.
///
/// Rows are created lazily on the first threshold breach and deactivated —
/// never deleted — when stock recovers, so the history of past breaches is
/// queryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowStockAlert {
    pub key: StockKey,
    pub alert_threshold: i64,
    /// Mirrored from the stock level row at recompute time.
    pub current_stock: i64,
    pub is_active: bool,
    pub last_alerted_at: Option<DateTime<Utc>>,
    /// Cooldown between re-notifications while the breach persists.
    pub alert_frequency: Duration,
    /// How many distinct breaches this key has had.
    pub triggered_count: u64,
}

/// Filters for listing alerts.
#[derive(Debug, Clone, Default)]
pub struct LowStockAlertFilter {
    pub active_only: bool,
    pub product_id: Option<ProductId>,
    pub location_id: Option<LocationId>,
}

/// Low-stock alert projection.
///
/// Recomputed synchronously by the engine whenever the stock level projection
/// changes a row; this type is never driven from the bus. Notification
/// delivery is someone else's job — this only maintains the breach state and
/// the rising-edge/cooldown stamping that delivery throttles on.
pub struct LowStockAlertsProjection<S>
where
    S: TenantStore<StockKey, LowStockAlert>,
{
    store: S,
    catalog: std::sync::Arc<dyn CatalogDirectory>,
    default_threshold: i64,
    cooldown: Duration,
}

impl<S> LowStockAlertsProjection<S>
where
    S: TenantStore<StockKey, LowStockAlert>,
{
    pub fn new(
        store: S,
        catalog: std::sync::Arc<dyn CatalogDirectory>,
        default_threshold: i64,
        cooldown: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            default_threshold,
            cooldown,
        }
    }

    pub fn get(&self, tenant_id: TenantId, key: &StockKey) -> Option<LowStockAlert> {
        self.store.get(tenant_id, key)
    }

    pub fn list(&self, tenant_id: TenantId, filter: &LowStockAlertFilter) -> Vec<LowStockAlert> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(|a| !filter.active_only || a.is_active)
            .filter(|a| filter.product_id.is_none_or(|p| a.key.product_id == p))
            .filter(|a| filter.location_id.is_none_or(|l| a.key.location_id == l))
            .collect()
    }

    /// Recompute the alert row for one key after its stock level changed.
    ///
    /// `as_of` is the business time of the movement that caused the change,
    /// so replays stamp the same instants.
    pub fn recompute(&self, tenant_id: TenantId, level: &StockLevel, as_of: DateTime<Utc>) {
        let key = level.key;
        let threshold = self
            .catalog
            .min_stock_level(tenant_id, key.product_id, key.variant_id)
            .unwrap_or(self.default_threshold);

        let existing = self.store.get(tenant_id, &key);
        let breached = level.current_stock <= threshold;

        let alert = match (existing, breached) {
            (None, false) => return,
            (None, true) => {
                tracing::debug!(%key, stock = level.current_stock, threshold, "low-stock alert raised");
                LowStockAlert {
                    key,
                    alert_threshold: threshold,
                    current_stock: level.current_stock,
                    is_active: true,
                    last_alerted_at: Some(as_of),
                    alert_frequency: self.cooldown,
                    triggered_count: 1,
                }
            }
            (Some(mut alert), true) => {
                alert.current_stock = level.current_stock;
                alert.alert_threshold = threshold;
                if !alert.is_active {
                    // Rising edge: re-notify and count a new breach.
                    alert.is_active = true;
                    alert.last_alerted_at = Some(as_of);
                    alert.triggered_count += 1;
                } else {
                    // Still breached: only re-stamp after the cooldown window.
                    let due = alert
                        .last_alerted_at
                        .is_none_or(|last| as_of - last >= alert.alert_frequency);
                    if due {
                        alert.last_alerted_at = Some(as_of);
                    }
                }
                alert
            }
            (Some(mut alert), false) => {
                // Deactivate, keep the row and its stamps.
                alert.current_stock = level.current_stock;
                alert.is_active = false;
                alert
            }
        };

        self.store.upsert(tenant_id, key, alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::{InMemoryCatalogDirectory, InMemoryTenantStore};
    use std::sync::Arc;
    use tally_catalog::{LocationId, ProductId};
    use tally_core::AggregateId;

    fn level(key: StockKey, current: i64) -> StockLevel {
        StockLevel {
            key,
            current_stock: current,
            reserved_stock: 0,
            available_stock: current,
            cost_per_unit: None,
            total_cost: 0,
            last_movement_at: None,
            last_counted_at: None,
        }
    }

    fn setup(
        default_threshold: i64,
        cooldown: Duration,
    ) -> (
        LowStockAlertsProjection<Arc<InMemoryTenantStore<StockKey, LowStockAlert>>>,
        Arc<InMemoryCatalogDirectory>,
    ) {
        let catalog = Arc::new(InMemoryCatalogDirectory::new());
        let proj = LowStockAlertsProjection::new(
            Arc::new(InMemoryTenantStore::new()),
            catalog.clone(),
            default_threshold,
            cooldown,
        );
        (proj, catalog)
    }

    fn test_key() -> StockKey {
        StockKey::new(
            ProductId::new(AggregateId::new()),
            LocationId::new(AggregateId::new()),
        )
    }

    #[test]
    fn no_row_is_created_above_threshold() {
        let (proj, _) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let key = test_key();

        proj.recompute(tenant_id, &level(key, 50), Utc::now());
        assert!(proj.get(tenant_id, &key).is_none());
    }

    #[test]
    fn first_breach_creates_an_active_alert() {
        let (proj, _) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let key = test_key();
        let now = Utc::now();

        proj.recompute(tenant_id, &level(key, 3), now);

        let alert = proj.get(tenant_id, &key).unwrap();
        assert!(alert.is_active);
        assert_eq!(alert.current_stock, 3);
        assert_eq!(alert.alert_threshold, 10);
        assert_eq!(alert.last_alerted_at, Some(now));
        assert_eq!(alert.triggered_count, 1);
    }

    #[test]
    fn product_threshold_overrides_the_default() {
        let (proj, catalog) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let key = test_key();
        catalog.register_product(tenant_id, key.product_id, Some(5));

        // 7 > 5: no breach even though the default threshold would fire.
        proj.recompute(tenant_id, &level(key, 7), Utc::now());
        assert!(proj.get(tenant_id, &key).is_none());

        proj.recompute(tenant_id, &level(key, 5), Utc::now());
        assert!(proj.get(tenant_id, &key).unwrap().is_active);
    }

    #[test]
    fn persistent_breach_respects_the_cooldown() {
        let (proj, _) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let key = test_key();
        let t0 = Utc::now();

        proj.recompute(tenant_id, &level(key, 3), t0);

        // One hour later, still breached: no re-stamp.
        proj.recompute(tenant_id, &level(key, 2), t0 + Duration::hours(1));
        let alert = proj.get(tenant_id, &key).unwrap();
        assert_eq!(alert.last_alerted_at, Some(t0));
        assert_eq!(alert.current_stock, 2);
        assert_eq!(alert.triggered_count, 1);

        // Past the cooldown: stamp again.
        proj.recompute(tenant_id, &level(key, 2), t0 + Duration::hours(25));
        let alert = proj.get(tenant_id, &key).unwrap();
        assert_eq!(alert.last_alerted_at, Some(t0 + Duration::hours(25)));
    }

    #[test]
    fn hysteresis_over_the_threshold() {
        let (proj, _) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let key = test_key();
        let t0 = Utc::now();

        // Breach, recover, breach again.
        proj.recompute(tenant_id, &level(key, 3), t0);
        let first_stamp = proj.get(tenant_id, &key).unwrap().last_alerted_at;

        proj.recompute(tenant_id, &level(key, 40), t0 + Duration::hours(1));
        let alert = proj.get(tenant_id, &key).unwrap();
        assert!(!alert.is_active);
        // Recovery does not touch the stamp.
        assert_eq!(alert.last_alerted_at, first_stamp);

        proj.recompute(tenant_id, &level(key, 4), t0 + Duration::hours(2));
        let alert = proj.get(tenant_id, &key).unwrap();
        assert!(alert.is_active);
        assert_eq!(alert.last_alerted_at, Some(t0 + Duration::hours(2)));
        assert_eq!(alert.triggered_count, 2);
    }

    #[test]
    fn listing_filters_by_activity_and_location() {
        let (proj, _) = setup(10, Duration::hours(24));
        let tenant_id = TenantId::new();
        let breached = test_key();
        let recovered = test_key();

        proj.recompute(tenant_id, &level(breached, 1), Utc::now());
        proj.recompute(tenant_id, &level(recovered, 1), Utc::now());
        proj.recompute(tenant_id, &level(recovered, 99), Utc::now());

        let all = proj.list(tenant_id, &LowStockAlertFilter::default());
        assert_eq!(all.len(), 2);

        let active = proj.list(
            tenant_id,
            &LowStockAlertFilter {
                active_only: true,
                ..Default::default()
            },
        );
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, breached);

        let at_location = proj.list(
            tenant_id,
            &LowStockAlertFilter {
                location_id: Some(breached.location_id),
                ..Default::default()
            },
        );
        assert_eq!(at_location.len(), 1);
    }
}
