//! Transfer order aggregate.
//!
//! The aggregate owns the order's state machine only. Stock effects of each
//! step (reserve, ship, receive, release) are carried out by the ledger in the
//! same transaction that appends the emitted events.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, ActorId, DomainError, ItemId, LocationId, TransferOrderId,
};
use stockledger_events::Event;

use crate::batch::BatchAllocation;

/// Transfer order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Pending,
    InTransit,
    Received,
    Cancelled,
}

/// Transfer order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderItem {
    pub item_id: ItemId,
    pub quantity_requested: i64,
    pub quantity_shipped: i64,
    pub quantity_received: i64,
    /// Serials that left the source.
    pub serials: Vec<String>,
    /// Lots that left the source.
    pub batches: Vec<BatchAllocation>,
    pub received_serials: Vec<String>,
    pub received_batches: Vec<BatchAllocation>,
    /// Unit cost carried from the source's cost layers.
    pub unit_cost: i64,
}

impl TransferOrderItem {
    pub fn outstanding(&self) -> i64 {
        self.quantity_shipped - self.quantity_received
    }

    fn received_from_lot(&self, lot: &str) -> i64 {
        self.received_batches
            .iter()
            .filter(|b| b.lot_number == lot)
            .map(|b| b.quantity)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLineRequest {
    pub item_id: ItemId,
    pub quantity: i64,
}

/// What the ledger actually moved out of the source for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedLine {
    pub item_id: ItemId,
    pub quantity: i64,
    pub serials: Vec<String>,
    pub batches: Vec<BatchAllocation>,
    pub unit_cost: i64,
}

/// Quantity arriving at the destination for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedLine {
    pub item_id: ItemId,
    pub quantity: i64,
    pub serials: Vec<String>,
    pub batches: Vec<BatchAllocation>,
}

/// Aggregate root: TransferOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrder {
    id: TransferOrderId,
    number: String,
    from_location: LocationId,
    to_location: LocationId,
    status: TransferStatus,
    lines: Vec<TransferOrderItem>,
    reserved: bool,
    requested_by: Option<ActorId>,
    approved_by: Option<ActorId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl TransferOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: TransferOrderId) -> Self {
        Self {
            id,
            number: String::new(),
            from_location: LocationId::from(""),
            to_location: LocationId::from(""),
            status: TransferStatus::Draft,
            lines: Vec::new(),
            reserved: false,
            requested_by: None,
            approved_by: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn from_location(&self) -> &LocationId {
        &self.from_location
    }

    pub fn to_location(&self) -> &LocationId {
        &self.to_location
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn lines(&self) -> &[TransferOrderItem] {
        &self.lines
    }

    pub fn line(&self, item_id: &ItemId) -> Option<&TransferOrderItem> {
        self.lines.iter().find(|l| &l.item_id == item_id)
    }

    /// True once approval has moved the requested quantities into `reserved`.
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn requested_by(&self) -> Option<&ActorId> {
        self.requested_by.as_ref()
    }

    pub fn approved_by(&self) -> Option<&ActorId> {
        self.approved_by.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Work out which serials and lots a partial receipt of `quantity` units
    /// covers.
    ///
    /// Explicit serials must have shipped and not yet arrived; otherwise the
    /// oldest outstanding serials are taken. Lots are filled in shipping order.
    pub fn plan_receipt(
        &self,
        item_id: &ItemId,
        quantity: i64,
        serials: &[String],
    ) -> Result<ReceivedLine, DomainError> {
        let line = self
            .line(item_id)
            .ok_or_else(|| DomainError::not_found("transfer line", item_id))?;
        if quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        if quantity > line.outstanding() {
            return Err(DomainError::validation(format!(
                "cannot receive {quantity} of {item_id}: only {} outstanding",
                line.outstanding()
            )));
        }

        let arrived: HashSet<&str> = line.received_serials.iter().map(String::as_str).collect();
        let receive_serials = if line.serials.is_empty() {
            if !serials.is_empty() {
                return Err(DomainError::validation(format!(
                    "no serials shipped for {item_id}"
                )));
            }
            Vec::new()
        } else if serials.is_empty() {
            line.serials
                .iter()
                .filter(|s| !arrived.contains(s.as_str()))
                .take(quantity as usize)
                .cloned()
                .collect()
        } else {
            if serials.len() as i64 != quantity {
                return Err(DomainError::validation(format!(
                    "{} serials supplied for {quantity} units",
                    serials.len()
                )));
            }
            for serial in serials {
                if !line.serials.contains(serial) || arrived.contains(serial.as_str()) {
                    return Err(DomainError::validation(format!(
                        "serial {serial} is not in transit on this order"
                    )));
                }
            }
            serials.to_vec()
        };

        let mut receive_batches = Vec::new();
        let mut remaining = quantity;
        for shipped in &line.batches {
            if remaining == 0 {
                break;
            }
            let open = shipped.quantity - line.received_from_lot(&shipped.lot_number);
            let take = open.min(remaining);
            if take > 0 {
                receive_batches.push(BatchAllocation::new(shipped.lot_number.clone(), take));
                remaining -= take;
            }
        }

        Ok(ReceivedLine {
            item_id: item_id.clone(),
            quantity,
            serials: receive_serials,
            batches: receive_batches,
        })
    }
}

impl AggregateRoot for TransferOrder {
    type Id = TransferOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateTransferOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferOrder {
    pub order_id: TransferOrderId,
    pub number: String,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub lines: Vec<TransferLineRequest>,
    pub requested_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Submit (availability is checked by the caller against the ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTransferOrder {
    pub order_id: TransferOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve (reserves stock at the source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveTransferOrder {
    pub order_id: TransferOrderId,
    pub approved_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Ship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipTransferOrder {
    pub order_id: TransferOrderId,
    pub lines: Vec<ShippedLine>,
    pub shipped_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Receive (partial receipts allowed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransferOrder {
    pub order_id: TransferOrderId,
    pub lines: Vec<ReceivedLine>,
    pub received_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransferOrder {
    pub order_id: TransferOrderId,
    pub reason: Option<String>,
    pub cancelled_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOrderCommand {
    Create(CreateTransferOrder),
    Submit(SubmitTransferOrder),
    Approve(ApproveTransferOrder),
    Ship(ShipTransferOrder),
    Receive(ReceiveTransferOrder),
    Cancel(CancelTransferOrder),
}

/// Event: TransferOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderCreated {
    pub order_id: TransferOrderId,
    pub number: String,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub lines: Vec<TransferLineRequest>,
    pub requested_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferOrderSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderSubmitted {
    pub order_id: TransferOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferOrderApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderApproved {
    pub order_id: TransferOrderId,
    pub approved_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferOrderShipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderShipped {
    pub order_id: TransferOrderId,
    pub lines: Vec<ShippedLine>,
    pub shipped_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferLinesReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLinesReceived {
    pub order_id: TransferOrderId,
    pub lines: Vec<ReceivedLine>,
    pub received_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferOrderReceived (every line fully received).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderReceived {
    pub order_id: TransferOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrderCancelled {
    pub order_id: TransferOrderId,
    pub reason: Option<String>,
    /// Whether an approval-time reservation was released.
    pub released_reservation: bool,
    pub cancelled_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOrderEvent {
    Created(TransferOrderCreated),
    Submitted(TransferOrderSubmitted),
    Approved(TransferOrderApproved),
    Shipped(TransferOrderShipped),
    LinesReceived(TransferLinesReceived),
    Received(TransferOrderReceived),
    Cancelled(TransferOrderCancelled),
}

impl Event for TransferOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferOrderEvent::Created(_) => "inventory.transfer.created",
            TransferOrderEvent::Submitted(_) => "inventory.transfer.submitted",
            TransferOrderEvent::Approved(_) => "inventory.transfer.approved",
            TransferOrderEvent::Shipped(_) => "inventory.transfer.shipped",
            TransferOrderEvent::LinesReceived(_) => "inventory.transfer.lines_received",
            TransferOrderEvent::Received(_) => "inventory.transfer.received",
            TransferOrderEvent::Cancelled(_) => "inventory.transfer.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferOrderEvent::Created(e) => e.occurred_at,
            TransferOrderEvent::Submitted(e) => e.occurred_at,
            TransferOrderEvent::Approved(e) => e.occurred_at,
            TransferOrderEvent::Shipped(e) => e.occurred_at,
            TransferOrderEvent::LinesReceived(e) => e.occurred_at,
            TransferOrderEvent::Received(e) => e.occurred_at,
            TransferOrderEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for TransferOrder {
    type Command = TransferOrderCommand;
    type Event = TransferOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferOrderEvent::Created(e) => {
                self.id = e.order_id.clone();
                self.number = e.number.clone();
                self.from_location = e.from_location.clone();
                self.to_location = e.to_location.clone();
                self.status = TransferStatus::Draft;
                self.lines = e
                    .lines
                    .iter()
                    .map(|l| TransferOrderItem {
                        item_id: l.item_id.clone(),
                        quantity_requested: l.quantity,
                        quantity_shipped: 0,
                        quantity_received: 0,
                        serials: Vec::new(),
                        batches: Vec::new(),
                        received_serials: Vec::new(),
                        received_batches: Vec::new(),
                        unit_cost: 0,
                    })
                    .collect();
                self.requested_by = Some(e.requested_by.clone());
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            TransferOrderEvent::Submitted(_) => {
                self.status = TransferStatus::Pending;
            }
            TransferOrderEvent::Approved(e) => {
                self.reserved = true;
                self.approved_by = Some(e.approved_by.clone());
            }
            TransferOrderEvent::Shipped(e) => {
                for shipped in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == shipped.item_id) {
                        line.quantity_shipped += shipped.quantity;
                        line.serials.extend(shipped.serials.iter().cloned());
                        line.batches.extend(shipped.batches.iter().cloned());
                        line.unit_cost = shipped.unit_cost;
                    }
                }
                self.reserved = false;
                self.status = TransferStatus::InTransit;
            }
            TransferOrderEvent::LinesReceived(e) => {
                for received in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == received.item_id) {
                        line.quantity_received += received.quantity;
                        line.received_serials.extend(received.serials.iter().cloned());
                        line.received_batches.extend(received.batches.iter().cloned());
                    }
                }
            }
            TransferOrderEvent::Received(_) => {
                self.status = TransferStatus::Received;
            }
            TransferOrderEvent::Cancelled(_) => {
                self.reserved = false;
                self.status = TransferStatus::Cancelled;
            }
        }

        self.updated_at = Some(event.occurred_at());
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferOrderCommand::Create(cmd) => self.handle_create(cmd),
            TransferOrderCommand::Submit(cmd) => self.handle_submit(cmd),
            TransferOrderCommand::Approve(cmd) => self.handle_approve(cmd),
            TransferOrderCommand::Ship(cmd) => self.handle_ship(cmd),
            TransferOrderCommand::Receive(cmd) => self.handle_receive(cmd),
            TransferOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl TransferOrder {
    fn ensure_exists(&self, order_id: &TransferOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found("transfer order", order_id));
        }
        if &self.id != order_id {
            return Err(DomainError::validation("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_status(&self, allowed: &[TransferStatus], to: TransferStatus) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("transfer order", self.status, to))
        }
    }

    fn handle_create(&self, cmd: &CreateTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("transfer order already exists"));
        }
        if cmd.from_location == cmd.to_location {
            return Err(DomainError::validation(
                "source and destination locations must differ",
            ));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("a transfer order needs at least one line"));
        }
        let mut seen = HashSet::new();
        for line in &cmd.lines {
            if line.quantity <= 0 {
                return Err(DomainError::validation("requested quantity must be positive"));
            }
            if !seen.insert(&line.item_id) {
                return Err(DomainError::validation(format!(
                    "item {} appears on more than one line",
                    line.item_id
                )));
            }
        }

        Ok(vec![TransferOrderEvent::Created(TransferOrderCreated {
            order_id: cmd.order_id.clone(),
            number: cmd.number.clone(),
            from_location: cmd.from_location.clone(),
            to_location: cmd.to_location.clone(),
            lines: cmd.lines.clone(),
            requested_by: cmd.requested_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &SubmitTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        self.ensure_exists(&cmd.order_id)?;
        self.ensure_status(&[TransferStatus::Draft], TransferStatus::Pending)?;
        Ok(vec![TransferOrderEvent::Submitted(TransferOrderSubmitted {
            order_id: cmd.order_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        self.ensure_exists(&cmd.order_id)?;
        self.ensure_status(&[TransferStatus::Pending], TransferStatus::Pending)?;
        if self.reserved {
            return Err(DomainError::validation("transfer order is already approved"));
        }
        Ok(vec![TransferOrderEvent::Approved(TransferOrderApproved {
            order_id: cmd.order_id.clone(),
            approved_by: cmd.approved_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_ship(&self, cmd: &ShipTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        self.ensure_exists(&cmd.order_id)?;
        self.ensure_status(&[TransferStatus::Pending], TransferStatus::InTransit)?;
        if !self.reserved {
            return Err(DomainError::validation(
                "transfer order must be approved before it ships",
            ));
        }
        if cmd.lines.len() != self.lines.len() {
            return Err(DomainError::validation("every line must ship in full"));
        }
        for line in &self.lines {
            let shipped = cmd
                .lines
                .iter()
                .find(|s| s.item_id == line.item_id)
                .ok_or_else(|| DomainError::validation(format!("line {} not shipped", line.item_id)))?;
            if shipped.quantity != line.quantity_requested {
                return Err(DomainError::validation(format!(
                    "line {} must ship {} units, got {}",
                    line.item_id, line.quantity_requested, shipped.quantity
                )));
            }
        }
        Ok(vec![TransferOrderEvent::Shipped(TransferOrderShipped {
            order_id: cmd.order_id.clone(),
            lines: cmd.lines.clone(),
            shipped_by: cmd.shipped_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        self.ensure_exists(&cmd.order_id)?;
        self.ensure_status(&[TransferStatus::InTransit], TransferStatus::Received)?;
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("nothing to receive"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cmd.lines.iter().find(|l| !seen.insert(&l.item_id)) {
            return Err(DomainError::validation(format!(
                "item {} listed twice in one receipt",
                dup.item_id
            )));
        }

        let mut after = self.clone();
        for received in &cmd.lines {
            let line = after
                .lines
                .iter_mut()
                .find(|l| l.item_id == received.item_id)
                .ok_or_else(|| DomainError::not_found("transfer line", &received.item_id))?;
            if received.quantity <= 0 || received.quantity > line.outstanding() {
                return Err(DomainError::validation(format!(
                    "cannot receive {} of {}: {} outstanding",
                    received.quantity,
                    received.item_id,
                    line.outstanding()
                )));
            }
            line.quantity_received += received.quantity;
        }

        let mut events = vec![TransferOrderEvent::LinesReceived(TransferLinesReceived {
            order_id: cmd.order_id.clone(),
            lines: cmd.lines.clone(),
            received_by: cmd.received_by.clone(),
            occurred_at: cmd.occurred_at,
        })];
        if after.lines.iter().all(|l| l.outstanding() == 0) {
            events.push(TransferOrderEvent::Received(TransferOrderReceived {
                order_id: cmd.order_id.clone(),
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_cancel(&self, cmd: &CancelTransferOrder) -> Result<Vec<TransferOrderEvent>, DomainError> {
        self.ensure_exists(&cmd.order_id)?;
        self.ensure_status(
            &[TransferStatus::Draft, TransferStatus::Pending],
            TransferStatus::Cancelled,
        )?;
        Ok(vec![TransferOrderEvent::Cancelled(TransferOrderCancelled {
            order_id: cmd.order_id.clone(),
            reason: cmd.reason.clone(),
            released_reservation: self.reserved,
            cancelled_by: cmd.cancelled_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
