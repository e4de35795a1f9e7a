//! Stock ledger domain module (event-sourced).
//!
//! One event stream per (product, variant, location) key holds the full
//! movement history for that key; the `StockAccount` aggregate decides
//! movements against the replayed balance. Business rules only — no IO, no
//! HTTP, no storage.

pub mod account;
pub mod movement;
pub mod serial;

pub use account::{
    MovementRecorded, RecordMovement, ReleaseStock, ReserveStock, StockAccount, StockCommand,
    StockEvent, StockReleased, StockReserved,
};
pub use movement::{MovementRef, MovementReason, MovementType, ReferenceKind, StockKey};
pub use serial::{SerialIndex, SerialIndexError};
