//! Lot/batch tracking per item and location.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId, LocationId, ShortageScope};

use crate::stock::StockKey;

/// Quantity drawn from (or put into) one lot by a movement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchAllocation {
    pub lot_number: String,
    pub quantity: i64,
}

impl BatchAllocation {
    pub fn new(lot_number: impl Into<String>, quantity: i64) -> Self {
        Self {
            lot_number: lot_number.into(),
            quantity,
        }
    }
}

/// Inbound lot description (receipts, positive counts, transfer arrivals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub lot_number: String,
    pub quantity: i64,
    pub manufacture_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

impl BatchReceipt {
    pub fn new(lot_number: impl Into<String>, quantity: i64) -> Self {
        Self {
            lot_number: lot_number.into(),
            quantity,
            manufacture_date: None,
            expiry_date: None,
        }
    }

    pub fn with_dates(mut self, manufactured: Option<NaiveDate>, expires: Option<NaiveDate>) -> Self {
        self.manufacture_date = manufactured;
        self.expiry_date = expires;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.lot_number.trim().is_empty() {
            return Err(DomainError::validation("lot number cannot be empty"));
        }
        if self.quantity <= 0 {
            return Err(DomainError::validation("batch receipt quantity must be positive"));
        }
        if let (Some(made), Some(expires)) = (self.manufacture_date, self.expiry_date) {
            if expires < made {
                return Err(DomainError::validation(format!(
                    "lot {} expires before it was manufactured",
                    self.lot_number
                )));
            }
        }
        Ok(())
    }

    pub fn allocation(&self) -> BatchAllocation {
        BatchAllocation::new(self.lot_number.clone(), self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Available,
    Quarantine,
    Expired,
    /// Fully consumed.
    Sold,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Available, Quarantine)
                | (Available, Expired)
                | (Available, Sold)
                | (Quarantine, Available)
                | (Quarantine, Expired)
                | (Sold, Available)
        )
    }
}

/// Order in which lots are drawn when the caller does not pin one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPolicy {
    /// Oldest manufacture date first.
    #[default]
    Fifo,
    /// Earliest expiry date first.
    Fefo,
}

impl core::str::FromStr for BatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(BatchPolicy::Fifo),
            "fefo" => Ok(BatchPolicy::Fefo),
            other => Err(format!("unknown batch policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub lot_number: String,
    pub quantity: i64,
    pub quantity_available: i64,
    pub manufacture_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub status: BatchStatus,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn receive(
        item_id: ItemId,
        location_id: LocationId,
        receipt: &BatchReceipt,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        receipt.validate()?;
        Ok(Self {
            item_id,
            location_id,
            lot_number: receipt.lot_number.clone(),
            quantity: receipt.quantity,
            quantity_available: receipt.quantity,
            manufacture_date: receipt.manufacture_date,
            expiry_date: receipt.expiry_date,
            status: BatchStatus::Available,
            received_at: at,
            updated_at: at,
        })
    }

    pub fn is_past_expiry(&self, today: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|expiry| today > expiry)
    }

    pub fn is_issuable(&self, today: NaiveDate) -> bool {
        self.status == BatchStatus::Available
            && !self.is_past_expiry(today)
            && self.quantity_available > 0
    }

    pub fn transition(&mut self, next: BatchStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::transition("batch", self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Lazy expiry; returns true if the batch changed state.
    pub fn expire_if_due(&mut self, today: NaiveDate, at: DateTime<Utc>) -> bool {
        if self.is_past_expiry(today)
            && matches!(self.status, BatchStatus::Available | BatchStatus::Quarantine)
        {
            self.status = BatchStatus::Expired;
            self.updated_at = at;
            return true;
        }
        false
    }

    /// Put units back into the lot (receipt into an existing lot, return).
    pub fn replenish(&mut self, quantity: i64, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("replenish quantity must be positive"));
        }
        match self.status {
            BatchStatus::Expired => {
                return Err(DomainError::transition(
                    "batch",
                    self.status,
                    BatchStatus::Available,
                ));
            }
            BatchStatus::Sold => self.status = BatchStatus::Available,
            BatchStatus::Available | BatchStatus::Quarantine => {}
        }
        self.quantity += quantity;
        self.quantity_available += quantity;
        self.updated_at = at;
        Ok(())
    }

    /// Draw units out of an issuable lot.
    pub fn consume(&mut self, quantity: i64, today: NaiveDate, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_issuable(today) || quantity > self.quantity_available {
            return Err(DomainError::insufficient(
                ShortageScope::Batch,
                &self.item_id,
                &self.location_id,
                quantity,
                if self.is_issuable(today) {
                    self.quantity_available
                } else {
                    0
                },
            ));
        }
        self.quantity_available -= quantity;
        if self.quantity_available == 0 {
            self.status = BatchStatus::Sold;
        }
        self.updated_at = at;
        Ok(())
    }
}

fn cmp_dates(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn policy_order(policy: BatchPolicy, a: &Batch, b: &Batch) -> Ordering {
    let primary = match policy {
        BatchPolicy::Fifo => cmp_dates(a.manufacture_date, b.manufacture_date),
        BatchPolicy::Fefo => cmp_dates(a.expiry_date, b.expiry_date)
            .then_with(|| cmp_dates(a.manufacture_date, b.manufacture_date)),
    };
    primary
        .then_with(|| a.received_at.cmp(&b.received_at))
        .then_with(|| a.lot_number.cmp(&b.lot_number))
}

/// Draw `quantity` units from the lots of one item/location.
///
/// Expired lots are transitioned lazily. `pinned` restricts the draw to one lot.
/// If the issuable lots cannot cover the request the whole draw fails with a
/// batch-qualified shortage; callers work on a staged copy and discard it.
pub fn allocate(
    batches: &mut [Batch],
    key: &StockKey,
    quantity: i64,
    policy: BatchPolicy,
    pinned: Option<&str>,
    now: DateTime<Utc>,
) -> DomainResult<Vec<BatchAllocation>> {
    if quantity <= 0 {
        return Err(DomainError::validation("allocation quantity must be positive"));
    }
    let today = now.date_naive();
    for batch in batches.iter_mut() {
        batch.expire_if_due(today, now);
    }

    if let Some(lot) = pinned {
        if !batches.iter().any(|b| b.lot_number == lot) {
            return Err(DomainError::not_found("batch", lot));
        }
    }

    let mut order: Vec<usize> = (0..batches.len())
        .filter(|&i| batches[i].is_issuable(today))
        .filter(|&i| pinned.is_none_or(|lot| batches[i].lot_number == lot))
        .collect();
    order.sort_by(|&a, &b| policy_order(policy, &batches[a], &batches[b]));

    let issuable: i64 = order.iter().map(|&i| batches[i].quantity_available).sum();
    if issuable < quantity {
        return Err(DomainError::insufficient(
            ShortageScope::Batch,
            &key.item_id,
            &key.location_id,
            quantity,
            issuable,
        ));
    }

    let mut remaining = quantity;
    let mut allocations = Vec::new();
    for i in order {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(batches[i].quantity_available);
        batches[i].consume(take, today, now)?;
        allocations.push(BatchAllocation::new(batches[i].lot_number.clone(), take));
        remaining -= take;
    }
    Ok(allocations)
}

/// Draw exactly the given lot quantities (caller-specified allocations).
pub fn consume_exact(
    batches: &mut [Batch],
    allocations: &[BatchAllocation],
    now: DateTime<Utc>,
) -> DomainResult<()> {
    let today = now.date_naive();
    for allocation in allocations {
        let batch = batches
            .iter_mut()
            .find(|b| b.lot_number == allocation.lot_number)
            .ok_or_else(|| DomainError::not_found("batch", &allocation.lot_number))?;
        batch.expire_if_due(today, now);
        batch.consume(allocation.quantity, today, now)?;
    }
    Ok(())
}
