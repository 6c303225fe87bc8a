use tracing::info;

use stockledger_core::{
    execute, ActorId, AggregateRoot, DomainError, DomainResult, LocationId, ShortageScope,
    TransferOrderId,
};
use stockledger_inventory::{
    ApproveTransferOrder, BatchReceipt, CancelTransferOrder, CreateTransferOrder, MovementKind,
    ReceiveTransferOrder, ReceivedLine, Reference, ReferenceKind, ShipTransferOrder, ShippedLine,
    StockKey, SubmitTransferOrder, TransferLeg, TransferLineRequest, TransferOrder,
    TransferOrderCommand, TransferOrderEvent, TransferStatus,
};

use super::{document_number, InventoryEngine};
use crate::ledger::{AdjustRequest, BatchSpec, LedgerTx};
use crate::store::{InventoryStore, Versioned, Write};

pub const TRANSFER_STREAM_TYPE: &str = "inventory.transfer_order";

fn reference(order: &TransferOrder) -> Reference {
    Reference::new(ReferenceKind::TransferOrder, order.id().as_str())
}

fn source_keys(order: &TransferOrder) -> Vec<StockKey> {
    order
        .lines()
        .iter()
        .map(|l| StockKey::new(l.item_id.clone(), order.from_location().clone()))
        .collect()
}

/// Sum repeated items, keeping first-seen order.
fn merge_lines(lines: Vec<TransferLineRequest>) -> Vec<TransferLineRequest> {
    let mut merged: Vec<TransferLineRequest> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.item_id == line.item_id) {
            Some(existing) => existing.quantity += line.quantity,
            None => merged.push(line),
        }
    }
    merged
}

fn stage<S: InventoryStore>(
    tx: &mut LedgerTx<'_, S>,
    order: &TransferOrder,
    version: u64,
    events: &[TransferOrderEvent],
) -> DomainResult<()> {
    tx.put_transfer(Write::update(order.clone(), version));
    tx.record(order.id().as_str(), TRANSFER_STREAM_TYPE, events)
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    pub fn get_transfer_order(&self, order_id: &TransferOrderId) -> DomainResult<TransferOrder> {
        Ok(self.load_transfer(order_id)?.value)
    }

    fn load_transfer(&self, order_id: &TransferOrderId) -> DomainResult<Versioned<TransferOrder>> {
        self.store
            .get_transfer(order_id)?
            .ok_or_else(|| DomainError::not_found("transfer order", order_id))
    }

    pub fn create_transfer_order(
        &self,
        from_location: &LocationId,
        to_location: &LocationId,
        lines: Vec<TransferLineRequest>,
        actor: &ActorId,
    ) -> DomainResult<TransferOrder> {
        for line in &lines {
            let item = self.require_item(&line.item_id)?.value;
            if !item.active {
                return Err(DomainError::validation(format!("item {} is inactive", item.id)));
            }
        }

        let now = self.now();
        let order_id = TransferOrderId::generate();
        let mut order = TransferOrder::empty(order_id.clone());
        let events = execute(
            &mut order,
            &TransferOrderCommand::Create(CreateTransferOrder {
                order_id: order_id.clone(),
                number: document_number("TO", now, order_id.as_str()),
                from_location: from_location.clone(),
                to_location: to_location.clone(),
                lines,
                requested_by: actor.clone(),
                occurred_at: now,
            }),
        )?;

        let mut tx = self.ledger.begin(Vec::new(), actor)?;
        stage(&mut tx, &order, 0, &events)?;
        tx.commit()?;
        info!(
            order_id = %order_id,
            number = order.number(),
            from = %from_location,
            to = %to_location,
            lines = order.lines().len(),
            "transfer order created"
        );
        Ok(order)
    }

    /// `draft → pending`. Checks source availability; reserves nothing.
    pub fn submit_transfer_order(&self, order_id: &TransferOrderId, actor: &ActorId) -> DomainResult<TransferOrder> {
        let current = self.load_transfer(order_id)?;
        let mut order = current.value;

        let mut tx = self.ledger.begin(source_keys(&order), actor)?;
        for line in order.lines() {
            let key = StockKey::new(line.item_id.clone(), order.from_location().clone());
            let available = tx.stock(&key)?.available;
            if available < line.quantity_requested {
                return Err(DomainError::insufficient(
                    ShortageScope::Ledger,
                    &line.item_id,
                    order.from_location(),
                    line.quantity_requested,
                    available,
                ));
            }
        }
        let events = execute(
            &mut order,
            &TransferOrderCommand::Submit(SubmitTransferOrder {
                order_id: order_id.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &order, current.version, &events)?;
        tx.commit()?;
        info!(order_id = %order_id, "transfer order submitted");
        Ok(order)
    }

    /// Reserve every requested quantity at the source.
    pub fn approve_transfer_order(&self, order_id: &TransferOrderId, actor: &ActorId) -> DomainResult<TransferOrder> {
        let current = self.load_transfer(order_id)?;
        let mut order = current.value;

        let mut tx = self.ledger.begin(source_keys(&order), actor)?;
        let events = execute(
            &mut order,
            &TransferOrderCommand::Approve(ApproveTransferOrder {
                order_id: order_id.clone(),
                approved_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        for line in order.lines() {
            tx.adjust(AdjustRequest::new(
                line.item_id.clone(),
                order.from_location().clone(),
                MovementKind::Transfer {
                    leg: TransferLeg::Reserve,
                },
                line.quantity_requested,
                reference(&order),
            ))?;
        }
        stage(&mut tx, &order, current.version, &events)?;
        tx.commit()?;
        info!(order_id = %order_id, approved_by = %actor, "transfer order approved");
        Ok(order)
    }

    /// Ship the reserved stock out of the source, capturing the serials, lots
    /// and unit cost that leave.
    pub fn ship_transfer_order(&self, order_id: &TransferOrderId, actor: &ActorId) -> DomainResult<TransferOrder> {
        let current = self.load_transfer(order_id)?;
        let mut order = current.value;
        if order.status() != TransferStatus::Pending {
            return Err(DomainError::transition(
                "transfer order",
                order.status(),
                TransferStatus::InTransit,
            ));
        }
        if !order.is_reserved() {
            return Err(DomainError::validation(
                "transfer order must be approved before it ships",
            ));
        }

        let mut tx = self.ledger.begin(source_keys(&order), actor)?;
        let mut shipped = Vec::with_capacity(order.lines().len());
        for line in order.lines() {
            let posting = tx.adjust(AdjustRequest::new(
                line.item_id.clone(),
                order.from_location().clone(),
                MovementKind::Transfer {
                    leg: TransferLeg::Ship,
                },
                -line.quantity_requested,
                reference(&order),
            ))?;
            shipped.push(ShippedLine {
                item_id: line.item_id.clone(),
                quantity: line.quantity_requested,
                serials: posting.movement.serials,
                batches: posting.movement.batches,
                unit_cost: posting.unit_cost.unwrap_or(0),
            });
        }
        let events = execute(
            &mut order,
            &TransferOrderCommand::Ship(ShipTransferOrder {
                order_id: order_id.clone(),
                lines: shipped,
                shipped_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &order, current.version, &events)?;
        tx.commit()?;
        info!(order_id = %order_id, "transfer order shipped");
        Ok(order)
    }

    /// Receive at the destination. `lines` empty means every outstanding unit;
    /// otherwise each entry is a partial receipt of that item, with repeated
    /// items summed into one receipt line.
    pub fn receive_transfer_order(
        &self,
        order_id: &TransferOrderId,
        lines: Vec<TransferLineRequest>,
        actor: &ActorId,
    ) -> DomainResult<TransferOrder> {
        let current = self.load_transfer(order_id)?;
        let mut order = current.value;
        if order.status() != TransferStatus::InTransit {
            return Err(DomainError::transition(
                "transfer order",
                order.status(),
                TransferStatus::Received,
            ));
        }

        let wanted: Vec<TransferLineRequest> = if lines.is_empty() {
            order
                .lines()
                .iter()
                .filter(|l| l.outstanding() > 0)
                .map(|l| TransferLineRequest {
                    item_id: l.item_id.clone(),
                    quantity: l.outstanding(),
                })
                .collect()
        } else {
            merge_lines(lines)
        };
        let mut received: Vec<ReceivedLine> = Vec::with_capacity(wanted.len());
        for request in &wanted {
            received.push(order.plan_receipt(&request.item_id, request.quantity, &[])?);
        }

        let keys: Vec<StockKey> = received
            .iter()
            .map(|r| StockKey::new(r.item_id.clone(), order.to_location().clone()))
            .collect();
        let mut tx = self.ledger.begin(keys, actor)?;
        for line in &received {
            let unit_cost = order.line(&line.item_id).map_or(0, |l| l.unit_cost);
            let batches = if line.batches.is_empty() {
                BatchSpec::Auto
            } else {
                let source_key = StockKey::new(line.item_id.clone(), order.from_location().clone());
                let source_lots = self.store.list_batches(&source_key)?;
                BatchSpec::Receipts(
                    line.batches
                        .iter()
                        .map(|a| {
                            let receipt = BatchReceipt::new(a.lot_number.clone(), a.quantity);
                            match source_lots.iter().find(|b| b.value.lot_number == a.lot_number) {
                                Some(src) => receipt.with_dates(src.value.manufacture_date, src.value.expiry_date),
                                None => receipt,
                            }
                        })
                        .collect(),
                )
            };
            tx.adjust(
                AdjustRequest::new(
                    line.item_id.clone(),
                    order.to_location().clone(),
                    MovementKind::Transfer {
                        leg: TransferLeg::Receive { unit_cost },
                    },
                    line.quantity,
                    reference(&order),
                )
                .with_serials(line.serials.clone())
                .with_batches(batches),
            )?;
        }
        let events = execute(
            &mut order,
            &TransferOrderCommand::Receive(ReceiveTransferOrder {
                order_id: order_id.clone(),
                lines: received,
                received_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &order, current.version, &events)?;
        tx.commit()?;
        info!(order_id = %order_id, status = ?order.status(), "transfer order received");
        Ok(order)
    }

    /// Cancel before shipping, releasing an approval-time reservation.
    pub fn cancel_transfer_order(
        &self,
        order_id: &TransferOrderId,
        reason: Option<String>,
        actor: &ActorId,
    ) -> DomainResult<TransferOrder> {
        let current = self.load_transfer(order_id)?;
        let mut order = current.value;
        let was_reserved = order.is_reserved();

        let mut tx = self.ledger.begin(source_keys(&order), actor)?;
        let events = execute(
            &mut order,
            &TransferOrderCommand::Cancel(CancelTransferOrder {
                order_id: order_id.clone(),
                reason,
                cancelled_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        if was_reserved {
            for line in order.lines() {
                tx.adjust(AdjustRequest::new(
                    line.item_id.clone(),
                    order.from_location().clone(),
                    MovementKind::Transfer {
                        leg: TransferLeg::Release,
                    },
                    line.quantity_requested,
                    reference(&order),
                ))?;
            }
        }
        stage(&mut tx, &order, current.version, &events)?;
        tx.commit()?;
        info!(order_id = %order_id, released = was_reserved, "transfer order cancelled");
        Ok(order)
    }
}
