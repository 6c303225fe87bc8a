use thiserror::Error;

use stockledger_core::DomainError;
use stockledger_events::{EventEnvelope, Projection};
use stockledger_inventory::{LocationStock, StockKey, StockMovement};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("envelope for stream {found} applied to projection of {expected}")]
    WrongStream { expected: String, found: String },

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("movement {movement_id} cannot be applied: {source}")]
    Rejected {
        movement_id: String,
        #[source]
        source: DomainError,
    },
}

impl From<ProjectionError> for DomainError {
    fn from(err: ProjectionError) -> Self {
        DomainError::infrastructure(err.to_string())
    }
}

/// `LocationStock` of one key, folded from its movement stream.
///
/// Redelivered envelopes (sequence at or below the cursor) are ignored; a gap
/// in the sequence is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationStockProjection {
    stream_id: String,
    stock: LocationStock,
    position: u64,
}

impl LocationStockProjection {
    pub fn new(key: &StockKey) -> Self {
        Self {
            stream_id: key.to_string(),
            stock: LocationStock::empty(key),
            position: 0,
        }
    }

    pub fn stock(&self) -> &LocationStock {
        &self.stock
    }

    pub fn into_stock(self) -> LocationStock {
        self.stock
    }
}

impl Projection for LocationStockProjection {
    type Ev = StockMovement;
    type Error = ProjectionError;

    fn apply(&mut self, envelope: &EventEnvelope<StockMovement>) -> Result<(), ProjectionError> {
        if envelope.stream_id() != self.stream_id {
            return Err(ProjectionError::WrongStream {
                expected: self.stream_id.clone(),
                found: envelope.stream_id().to_string(),
            });
        }

        let seq = envelope.sequence_number();
        if seq <= self.position {
            return Ok(());
        }
        if seq != self.position + 1 {
            return Err(ProjectionError::NonMonotonicSequence {
                last: self.position,
                found: seq,
            });
        }

        let movement = envelope.payload();
        self.stock
            .apply(movement)
            .map_err(|source| ProjectionError::Rejected {
                movement_id: movement.id.to_string(),
                source,
            })?;
        self.position = seq;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Fold a full stream into a fresh row.
pub fn replay_location_stock<'a>(
    key: &StockKey,
    envelopes: impl IntoIterator<Item = &'a EventEnvelope<StockMovement>>,
) -> Result<LocationStock, ProjectionError> {
    let mut projection = LocationStockProjection::new(key);
    for envelope in envelopes {
        projection.apply(envelope)?;
    }
    Ok(projection.into_stock())
}
