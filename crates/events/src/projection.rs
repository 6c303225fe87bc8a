use crate::{Event, EventEnvelope};

/// A projection builds a read model from an append-only event stream.
///
/// Read models are disposable: they can be dropped and rebuilt at any time by
/// replaying the stream from the first event, which is how the stock ledger
/// proves that `LocationStock` matches its movement log.
///
/// `apply` must be idempotent with respect to redelivery: implementations track
/// the last applied sequence number and ignore anything at or below it.
pub trait Projection {
    type Ev: Event;
    type Error: core::fmt::Debug;

    /// Apply a single event to the read model.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) -> Result<(), Self::Error>;

    /// Last sequence number applied (0 when empty).
    fn position(&self) -> u64;
}
