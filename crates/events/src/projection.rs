use crate::{Event, EventEnvelope};

/// A projection builds a read model from an append-only event stream.
///
/// Read models are **disposable**: events are the source of truth, and a
/// projection can be deleted and rebuilt from them at any time. Projections
/// must be **idempotent** — applying the same envelope twice must produce the
/// same state — so at-least-once delivery and crash recovery are safe. The
/// concrete projections track per-stream sequence cursors for this.
///
/// The envelope carries `tenant_id`; implementations must scope every update
/// to the event's tenant.
///
/// Persistence is an infrastructure concern; this trait only defines the
/// apply step.
pub trait Projection {
    type Ev: Event;

    /// Apply a single event to the projection, updating the read model.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
