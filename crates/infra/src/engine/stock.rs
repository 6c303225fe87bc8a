use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use stockledger_core::{ActorId, DomainError, DomainResult, ItemId, LocationId};
use stockledger_inventory::{
    Batch, BatchAllocation, BatchReceipt, BatchStatus, CostDraw, LocationStock, MovementKind,
    Reference, ReferenceKind, SerialNumber, SerialStatus, StockKey, StockMovement,
};

use super::InventoryEngine;
use crate::ledger::{AdjustRequest, BatchSpec, Posting};
use crate::projections::replay_location_stock;
use crate::store::{ChangeSet, InventoryStore, MovementQuery, Write};

/// Goods arriving from outside (supplier delivery, opening balance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveStock {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    /// Falls back to the item's cost price.
    pub unit_cost: Option<i64>,
    pub reference: Reference,
    pub serials: Vec<String>,
    pub lots: Vec<BatchReceipt>,
}

impl ReceiveStock {
    pub fn new(item_id: ItemId, location_id: LocationId, quantity: i64, reference: Reference) -> Self {
        Self {
            item_id,
            location_id,
            quantity,
            unit_cost: None,
            reference,
            serials: Vec::new(),
            lots: Vec::new(),
        }
    }

    pub fn with_unit_cost(mut self, unit_cost: i64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    pub fn with_serials(mut self, serials: Vec<String>) -> Self {
        self.serials = serials;
        self
    }

    pub fn with_lots(mut self, lots: Vec<BatchReceipt>) -> Self {
        self.lots = lots;
        self
    }
}

/// Goods leaving for consumption (sale, production). `quantity` is positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueStock {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub reference: Reference,
    pub serials: Vec<String>,
    pub batches: BatchSpec,
}

impl IssueStock {
    pub fn new(item_id: ItemId, location_id: LocationId, quantity: i64, reference: Reference) -> Self {
        Self {
            item_id,
            location_id,
            quantity,
            reference,
            serials: Vec::new(),
            batches: BatchSpec::Auto,
        }
    }

    pub fn with_serials(mut self, serials: Vec<String>) -> Self {
        self.serials = serials;
        self
    }

    pub fn with_batch(mut self, lot_number: impl Into<String>) -> Self {
        self.batches = BatchSpec::Pinned(lot_number.into());
        self
    }

    pub fn with_allocations(mut self, allocations: Vec<BatchAllocation>) -> Self {
        self.batches = BatchSpec::Allocations(allocations);
        self
    }
}

/// Previously sold goods coming back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnStock {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub reference: Reference,
    pub serials: Vec<String>,
    pub batches: Vec<BatchAllocation>,
    pub reason: Option<String>,
}

impl ReturnStock {
    pub fn new(item_id: ItemId, location_id: LocationId, quantity: i64, reference: Reference) -> Self {
        Self {
            item_id,
            location_id,
            quantity,
            reference,
            serials: Vec::new(),
            batches: Vec::new(),
            reason: None,
        }
    }

    pub fn with_serials(mut self, serials: Vec<String>) -> Self {
        self.serials = serials;
        self
    }

    pub fn with_batches(mut self, batches: Vec<BatchAllocation>) -> Self {
        self.batches = batches;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Stored row vs. the row rebuilt from the movement log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionCheck {
    pub key: StockKey,
    pub stored: LocationStock,
    pub replayed: LocationStock,
    pub movements: u64,
}

impl ProjectionCheck {
    pub fn is_consistent(&self) -> bool {
        same_buckets(&self.stored, &self.replayed)
    }
}

fn same_buckets(a: &LocationStock, b: &LocationStock) -> bool {
    (a.on_hand, a.available, a.reserved, a.damaged, a.on_order)
        == (b.on_hand, b.available, b.reserved, b.damaged, b.on_order)
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    /// General-purpose adjustment. Transfer and kit legs belong to their
    /// workflows and are refused here.
    pub fn adjust_stock(&self, request: AdjustRequest, actor: &ActorId) -> DomainResult<Posting> {
        if matches!(
            request.kind,
            MovementKind::Transfer { .. } | MovementKind::KitAssembly { .. }
        ) {
            return Err(DomainError::validation(format!(
                "{} movements are posted by their workflow, not directly",
                request.kind.movement_type().as_str()
            )));
        }
        if matches!(
            request.kind,
            MovementKind::Adjustment | MovementKind::Count | MovementKind::Damage
        ) && request.reason.as_deref().is_none_or(|r| r.trim().is_empty())
        {
            return Err(DomainError::validation("adjustments need a reason"));
        }
        self.ledger.adjust(request, actor)
    }

    /// Receive goods. A receipt against a purchase order also draws down the
    /// key's on-order quantity in the same transaction.
    pub fn receive_stock(&self, receipt: ReceiveStock, actor: &ActorId) -> DomainResult<Posting> {
        let item = self.require_item(&receipt.item_id)?.value;
        let unit_cost = receipt.unit_cost.unwrap_or(item.cost_price);
        let key = StockKey::new(receipt.item_id.clone(), receipt.location_id.clone());
        let batches = if receipt.lots.is_empty() {
            BatchSpec::Auto
        } else {
            BatchSpec::Receipts(receipt.lots)
        };

        let mut tx = self.ledger.begin([key.clone()], actor)?;
        let on_order = tx.stock(&key)?.on_order;
        let posting = tx.adjust(
            AdjustRequest::new(
                receipt.item_id.clone(),
                receipt.location_id.clone(),
                MovementKind::Receipt { unit_cost },
                receipt.quantity,
                receipt.reference.clone(),
            )
            .with_serials(receipt.serials)
            .with_batches(batches),
        )?;

        let cleared = if receipt.reference.kind == ReferenceKind::PurchaseOrder && on_order > 0 {
            let cleared = on_order.min(receipt.quantity);
            tx.adjust(AdjustRequest::new(
                receipt.item_id.clone(),
                receipt.location_id.clone(),
                MovementKind::OnOrder,
                -cleared,
                receipt.reference.clone(),
            ))?;
            cleared
        } else {
            0
        };
        tx.commit()?;

        info!(
            item_id = %receipt.item_id,
            location_id = %receipt.location_id,
            quantity = receipt.quantity,
            unit_cost,
            on_order_cleared = cleared,
            "stock received"
        );
        // The receipt posting predates the on-order draw; report the final row.
        let stock = self.stock_level(&receipt.item_id, &receipt.location_id)?;
        Ok(Posting { stock, ..posting })
    }

    pub fn issue_stock(&self, issue: IssueStock, actor: &ActorId) -> DomainResult<Posting> {
        if issue.quantity <= 0 {
            return Err(DomainError::validation("issue quantity must be positive"));
        }
        let posting = self.ledger.adjust(
            AdjustRequest::new(
                issue.item_id,
                issue.location_id,
                MovementKind::Issue,
                -issue.quantity,
                issue.reference,
            )
            .with_serials(issue.serials)
            .with_batches(issue.batches),
            actor,
        )?;
        info!(
            movement_id = %posting.movement.id,
            item_id = %posting.movement.item_id,
            quantity = issue.quantity,
            unit_cost = posting.unit_cost,
            "stock issued"
        );
        Ok(posting)
    }

    /// Move units from available to damaged. They stay on hand (and keep their
    /// cost) until [`write_off_damaged`](Self::write_off_damaged) removes them.
    pub fn damage_stock(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        quantity: i64,
        reason: &str,
        serials: Vec<String>,
        actor: &ActorId,
    ) -> DomainResult<Posting> {
        if reason.trim().is_empty() {
            return Err(DomainError::validation("damage needs a reason"));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("damage quantity must be positive"));
        }
        let posting = self.ledger.adjust(
            AdjustRequest::new(
                item_id.clone(),
                location_id.clone(),
                MovementKind::Damage,
                quantity,
                Reference::manual("damage"),
            )
            .with_serials(serials)
            .with_reason(reason),
            actor,
        )?;
        warn!(%item_id, %location_id, quantity, reason, "stock marked damaged");
        Ok(posting)
    }

    /// Remove damaged units from the books: draws the damaged bucket, consumes
    /// cost layers and moves damaged serials to written-off.
    pub fn write_off_damaged(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        quantity: i64,
        reason: &str,
        serials: Vec<String>,
        actor: &ActorId,
    ) -> DomainResult<Posting> {
        if reason.trim().is_empty() {
            return Err(DomainError::validation("write-off needs a reason"));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("write-off quantity must be positive"));
        }
        let posting = self.ledger.adjust(
            AdjustRequest::new(
                item_id.clone(),
                location_id.clone(),
                MovementKind::Damage,
                -quantity,
                Reference::manual("write-off"),
            )
            .with_serials(serials)
            .with_reason(reason),
            actor,
        )?;
        warn!(
            %item_id,
            %location_id,
            quantity,
            value = posting.cost.as_ref().map_or(0, |c| c.total_cost),
            reason,
            "damaged stock written off"
        );
        Ok(posting)
    }

    pub fn return_stock(&self, ret: ReturnStock, actor: &ActorId) -> DomainResult<Posting> {
        let batches = if ret.batches.is_empty() {
            BatchSpec::Auto
        } else {
            BatchSpec::Allocations(ret.batches)
        };
        let mut request = AdjustRequest::new(
            ret.item_id,
            ret.location_id,
            MovementKind::Return,
            ret.quantity,
            ret.reference,
        )
        .with_serials(ret.serials)
        .with_batches(batches);
        request.reason = ret.reason;

        let posting = self.ledger.adjust(request, actor)?;
        info!(
            movement_id = %posting.movement.id,
            item_id = %posting.movement.item_id,
            quantity = posting.movement.quantity,
            "stock returned"
        );
        Ok(posting)
    }

    /// Book expected inbound quantity (positive) or cancel it (negative).
    pub fn record_on_order(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        quantity: i64,
        reference: Reference,
        actor: &ActorId,
    ) -> DomainResult<Posting> {
        self.require_item(item_id)?;
        self.ledger.adjust(
            AdjustRequest::new(
                item_id.clone(),
                location_id.clone(),
                MovementKind::OnOrder,
                quantity,
                reference,
            ),
            actor,
        )
    }

    pub fn quarantine_batch(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        lot_number: &str,
        actor: &ActorId,
    ) -> DomainResult<Batch> {
        self.set_batch_status(item_id, location_id, lot_number, BatchStatus::Quarantine, actor)
    }

    pub fn release_batch(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        lot_number: &str,
        actor: &ActorId,
    ) -> DomainResult<Batch> {
        self.set_batch_status(item_id, location_id, lot_number, BatchStatus::Available, actor)
    }

    fn set_batch_status(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        lot_number: &str,
        status: BatchStatus,
        actor: &ActorId,
    ) -> DomainResult<Batch> {
        let key = StockKey::new(item_id.clone(), location_id.clone());
        let mut tx = self.ledger.begin([key.clone()], actor)?;
        let now = tx.now();
        let batch = tx.update_batch(&key, lot_number, |b| b.transition(status, now))?;
        tx.commit()?;
        info!(%item_id, %location_id, lot_number, status = ?status, "batch status changed");
        Ok(batch)
    }

    /// Transition every lot past its expiry date to `expired`.
    pub fn sweep_expired_batches(&self, actor: &ActorId) -> DomainResult<Vec<Batch>> {
        let today = self.now().date_naive();
        let due: Vec<Batch> = self
            .store
            .all_batches()?
            .into_iter()
            .filter(|b| {
                b.is_past_expiry(today)
                    && matches!(b.status, BatchStatus::Available | BatchStatus::Quarantine)
            })
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let keys: BTreeSet<StockKey> = due
            .iter()
            .map(|b| StockKey::new(b.item_id.clone(), b.location_id.clone()))
            .collect();
        let mut tx = self.ledger.begin(keys, actor)?;
        let now = tx.now();
        let mut expired = Vec::with_capacity(due.len());
        for batch in &due {
            let key = StockKey::new(batch.item_id.clone(), batch.location_id.clone());
            let updated = tx.update_batch(&key, &batch.lot_number, |b| {
                b.expire_if_due(today, now);
                Ok(())
            })?;
            if updated.status == BatchStatus::Expired {
                expired.push(updated);
            }
        }
        tx.commit()?;
        info!(expired = expired.len(), "expired batches swept");
        Ok(expired)
    }

    /// Put a returned serialized unit back into sellable stock.
    pub fn restock_serial(&self, item_id: &ItemId, serial: &str, actor: &ActorId) -> DomainResult<SerialNumber> {
        let current = self
            .store
            .get_serial(item_id, serial)?
            .ok_or_else(|| DomainError::not_found("serial", serial))?
            .value;
        let key = StockKey::new(item_id.clone(), current.location_id.clone());

        let mut tx = self.ledger.begin([key], actor)?;
        let now = tx.now();
        let unit = tx.update_serial(item_id, serial, |s| s.transition(SerialStatus::Available, None, now))?;
        tx.commit()?;
        info!(%item_id, serial, "serial restocked");
        Ok(unit)
    }

    /// Current row for the key; an item that never moved there reads as zero.
    pub fn stock_level(&self, item_id: &ItemId, location_id: &LocationId) -> DomainResult<LocationStock> {
        self.require_item(item_id)?;
        let key = StockKey::new(item_id.clone(), location_id.clone());
        Ok(self
            .store
            .get_stock(&key)?
            .map(|row| row.value)
            .unwrap_or_else(|| LocationStock::empty(&key)))
    }

    pub fn list_stock(&self, location_id: Option<&LocationId>) -> DomainResult<Vec<LocationStock>> {
        Ok(self.store.list_stock(location_id)?)
    }

    pub fn list_movements(&self, query: &MovementQuery) -> DomainResult<Vec<StockMovement>> {
        Ok(self.store.movements(query)?)
    }

    pub fn verify_stock_projection(&self, item_id: &ItemId, location_id: &LocationId) -> DomainResult<ProjectionCheck> {
        let key = StockKey::new(item_id.clone(), location_id.clone());
        let stream = self.store.movement_stream(&key)?;
        let replayed = replay_location_stock(&key, &stream)?;
        let stored = self
            .store
            .get_stock(&key)?
            .map(|row| row.value)
            .unwrap_or_else(|| LocationStock::empty(&key));
        Ok(ProjectionCheck {
            key,
            stored,
            replayed,
            movements: stream.len() as u64,
        })
    }

    /// Replace the stored row with the one folded from the movement log.
    pub fn rebuild_stock(&self, item_id: &ItemId, location_id: &LocationId) -> DomainResult<LocationStock> {
        let key = StockKey::new(item_id.clone(), location_id.clone());
        let _guard = self.ledger.locks().acquire([key.clone()])?;

        let stream = self.store.movement_stream(&key)?;
        let replayed = replay_location_stock(&key, &stream)?;
        let stored = self.store.get_stock(&key)?;
        let (version, drifted) = match &stored {
            Some(row) => (row.version, !same_buckets(&row.value, &replayed)),
            None => (0, !stream.is_empty()),
        };
        if drifted {
            warn!(%key, version, "stock row drifted from its movement log; rebuilding");
            self.store.commit(ChangeSet {
                stock: vec![Write::update(replayed.clone(), version)],
                ..ChangeSet::default()
            })?;
        }
        Ok(replayed)
    }

    /// Price an issue of `quantity` units without consuming any layer.
    pub fn price_issue(&self, item_id: &ItemId, location_id: &LocationId, quantity: i64) -> DomainResult<CostDraw> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        let item = self.require_item(item_id)?.value;
        let key = StockKey::new(item_id.clone(), location_id.clone());
        let draw = match self.store.get_cost_layers(&key)? {
            Some(row) => {
                let fallback = row.value.average_cost().unwrap_or(item.cost_price);
                row.value.preview(item.costing_method, quantity, &[], fallback)
            }
            None => CostDraw {
                quantity,
                total_cost: quantity * item.cost_price,
                ..CostDraw::default()
            },
        };
        Ok(draw)
    }
}
