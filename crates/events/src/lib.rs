//! Event abstractions shared by the stock ledger and the workflow aggregates.
//!
//! Stock movements and workflow events are facts: immutable, versioned and
//! append-only. Read models (such as `LocationStock`) are projections over them.

pub mod envelope;
pub mod event;
pub mod projection;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use projection::Projection;
