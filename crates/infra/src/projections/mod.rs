//! Projection implementations (read model builders).
//!
//! Projections consume committed events and build query-optimized read
//! models. All projections are:
//! - **Rebuildable**: reconstructed from the event stream at any time
//! - **Tenant-isolated**: data is partitioned by tenant
//! - **Idempotent**: safe for at-least-once delivery (per-stream cursors)
//!
//! The stock level and low-stock alert read models are owned exclusively by
//! the engine's apply path; nothing else writes them.

pub mod low_stock_alerts;
pub mod purchase_orders;
pub mod stock_levels;

pub use low_stock_alerts::{LowStockAlert, LowStockAlertFilter, LowStockAlertsProjection};
pub use purchase_orders::{PurchaseOrderReadModel, PurchaseOrdersProjection};
pub use stock_levels::{StockLevel, StockLevelsProjection};
