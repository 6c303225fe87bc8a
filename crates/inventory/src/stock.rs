//! Per item × location quantity state (the ledger projection).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId, LocationId, ShortageScope};

use crate::movement::StockMovement;

/// Ledger key. Ordering (item, then location) is the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub item_id: ItemId,
    pub location_id: LocationId,
}

impl StockKey {
    pub fn new(item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            item_id,
            location_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.item_id, self.location_id)
    }
}

/// Signed bucket deltas of one movement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockEffect {
    pub available: i64,
    pub reserved: i64,
    pub damaged: i64,
    pub on_order: i64,
}

impl StockEffect {
    pub fn on_hand(&self) -> i64 {
        self.available + self.reserved + self.damaged
    }
}

/// Materialized stock for one item at one location.
///
/// Invariant: `on_hand == available + reserved + damaged`, every bucket ≥ 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStock {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub on_hand: i64,
    pub available: i64,
    pub reserved: i64,
    pub on_order: i64,
    pub damaged: i64,
    pub last_movement_at: Option<DateTime<Utc>>,
}

impl LocationStock {
    pub fn empty(key: &StockKey) -> Self {
        Self {
            item_id: key.item_id.clone(),
            location_id: key.location_id.clone(),
            on_hand: 0,
            available: 0,
            reserved: 0,
            on_order: 0,
            damaged: 0,
            last_movement_at: None,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.item_id.clone(), self.location_id.clone())
    }

    pub fn is_consistent(&self) -> bool {
        self.on_hand == self.available + self.reserved + self.damaged
            && self.available >= 0
            && self.reserved >= 0
            && self.damaged >= 0
            && self.on_order >= 0
    }

    /// Apply a movement, rejecting it (and leaving `self` untouched) if any
    /// bucket would go negative.
    pub fn apply(&mut self, movement: &StockMovement) -> DomainResult<()> {
        if movement.item_id != self.item_id || movement.location_id != self.location_id {
            return Err(DomainError::validation(format!(
                "movement for {} applied to stock row {}",
                movement.key(),
                self.key()
            )));
        }

        let effect = movement.effect();
        let available = self.available + effect.available;
        let reserved = self.reserved + effect.reserved;
        let damaged = self.damaged + effect.damaged;
        let on_order = self.on_order + effect.on_order;

        if available < 0 {
            return Err(DomainError::insufficient(
                ShortageScope::Ledger,
                &self.item_id,
                &self.location_id,
                -effect.available,
                self.available,
            ));
        }
        if reserved < 0 {
            return Err(DomainError::insufficient(
                ShortageScope::Reservation,
                &self.item_id,
                &self.location_id,
                -effect.reserved,
                self.reserved,
            ));
        }
        if damaged < 0 {
            return Err(DomainError::insufficient(
                ShortageScope::Damaged,
                &self.item_id,
                &self.location_id,
                -effect.damaged,
                self.damaged,
            ));
        }
        if on_order < 0 {
            return Err(DomainError::validation(format!(
                "on-order quantity for {} cannot go negative",
                self.key()
            )));
        }

        self.available = available;
        self.reserved = reserved;
        self.damaged = damaged;
        self.on_order = on_order;
        self.on_hand = available + reserved + damaged;
        self.last_movement_at = Some(movement.occurred_at);
        Ok(())
    }
}
