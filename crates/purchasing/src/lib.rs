//! Purchasing domain module (event-sourced).
//!
//! The purchase order lifecycle is an explicit transition table on
//! `PurchaseOrderStatus`; entering a receiving state emits a goods-received
//! event that the engine converts into stock movements.

pub mod order;

pub use order::{
    AddLineItem, CreatePurchaseOrder, GoodsReceived, LineItem, LineItemAdded, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderCreated, PurchaseOrderEvent, PurchaseOrderId,
    PurchaseOrderStatus, ReceiptLine, ReceivedLine, StatusChanged, TransitionStatus,
};
