//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{ItemId, LocationId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Which quantity a shortage was measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortageScope {
    /// `LocationStock.available` would go negative.
    Ledger,
    /// Issuable (non-expired, non-quarantined) batch quantity cannot cover the request.
    Batch,
    /// Reserved quantity cannot cover a release or a reserved shipment.
    Reservation,
    /// Damaged quantity cannot cover a write-off.
    Damaged,
}

impl core::fmt::Display for ShortageScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ShortageScope::Ledger => f.write_str("ledger"),
            ShortageScope::Batch => f.write_str("batch"),
            ShortageScope::Reservation => f.write_str("reservation"),
            ShortageScope::Damaged => f.write_str("damaged"),
        }
    }
}

/// Details of an `InsufficientStock` failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub scope: ShortageScope,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub requested: i64,
    pub available: i64,
}

impl core::fmt::Display for Shortage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} shortage for item {} at {} (requested {}, available {})",
            self.scope, self.item_id, self.location_id, self.requested, self.available
        )
    }
}

/// Caller-facing classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Re-read state and try again.
    RetrySafe,
    /// The request itself must be corrected.
    Fatal,
}

/// Domain-level error.
///
/// Mutating operations are fail-closed: whenever one of these is returned, no
/// ledger or state-machine change has been committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Ledger-, batch- or reservation-qualified shortage.
    #[error("insufficient stock: {0}")]
    InsufficientStock(Shortage),

    /// Illegal serial/batch/order/count state change.
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Unknown item/location/order/count id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lost an optimistic-lock race; safe to retry after re-reading state.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// No forecasting model can serve the request.
    #[error("no forecast model available: {0}")]
    NoModelAvailable(String),

    /// Not enough movement history to run the requested analysis.
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    /// An analytical job was cancelled or ran past its deadline.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The backing store failed for a reason unrelated to the request.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl DomainError {
    pub fn insufficient(
        scope: ShortageScope,
        item_id: &ItemId,
        location_id: &LocationId,
        requested: i64,
        available: i64,
    ) -> Self {
        Self::InsufficientStock(Shortage {
            scope,
            item_id: item_id.clone(),
            location_id: location_id.clone(),
            requested,
            available,
        })
    }

    pub fn transition(
        entity: &'static str,
        from: impl core::fmt::Debug,
        to: impl core::fmt::Debug,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: format!("{from:?}").to_lowercase(),
            to: format!("{to:?}").to_lowercase(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Retry-safe vs. fatal classification for the calling layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            DomainError::ConcurrencyConflict(_) => ErrorClass::RetrySafe,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retry_safe(&self) -> bool {
        self.class() == ErrorClass::RetrySafe
    }
}
