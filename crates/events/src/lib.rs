//! Event plumbing shared by the ledger and workflow modules.
//!
//! Events here are **facts**: immutable, versioned, append-only. The crate
//! carries no storage or transport implementation beyond an in-memory bus for
//! tests/dev; persistence lives in `tally-infra`.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod projection;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
pub use projection::Projection;
pub use tenant::TenantScoped;
