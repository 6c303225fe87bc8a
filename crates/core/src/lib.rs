//! `stockledger-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by every other crate in
//! the workspace: identifiers, the domain error model, aggregate traits and the
//! clock abstraction. No infrastructure concerns live here.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{execute, Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DomainError, DomainResult, ErrorClass, Shortage, ShortageScope};
pub use id::{ActorId, CycleCountId, ItemId, LocationId, MovementId, TransferOrderId};
