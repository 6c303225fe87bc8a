//! Stock movements: the append-only ledger entries.
//!
//! Every quantity change is recorded as a `StockMovement` before the
//! `LocationStock` projection is updated. The payload is a closed tagged union
//! (`MovementKind`) so each movement type only carries the fields it needs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ActorId, DomainError, DomainResult, ItemId, LocationId, MovementId};
use stockledger_events::Event;

use crate::batch::BatchAllocation;
use crate::stock::{StockEffect, StockKey};

/// Flat movement type, as reported to callers and used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Receipt,
    Issue,
    Transfer,
    Adjustment,
    Count,
    Damage,
    Return,
    KitAssembly,
    OnOrder,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Receipt => "receipt",
            MovementType::Issue => "issue",
            MovementType::Transfer => "transfer",
            MovementType::Adjustment => "adjustment",
            MovementType::Count => "count",
            MovementType::Damage => "damage",
            MovementType::Return => "return",
            MovementType::KitAssembly => "kit_assembly",
            MovementType::OnOrder => "on_order",
        }
    }
}

/// Step of a transfer order reflected in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferLeg {
    /// available → reserved at the source (approval).
    Reserve,
    /// reserved → available at the source (cancellation).
    Release,
    /// Reserved stock leaves the source.
    Ship,
    /// Stock arrives at the destination, carrying the shipped unit cost.
    Receive { unit_cost: i64 },
}

/// Step of a kit assembly or disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitLeg {
    ComponentIssue,
    KitReceipt { unit_cost: i64 },
    KitIssue,
    ComponentReceipt { unit_cost: i64 },
}

/// Closed set of movement payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MovementKind {
    Receipt { unit_cost: i64 },
    Issue,
    Transfer { leg: TransferLeg },
    Adjustment,
    Count,
    /// Positive: available → damaged, on-hand unchanged. Negative: damaged
    /// units written off, leaving on-hand.
    Damage,
    Return,
    KitAssembly { leg: KitLeg },
    /// Expected inbound quantity (purchase pipeline); no on-hand effect.
    OnOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    Positive,
    Negative,
    Either,
}

impl MovementKind {
    pub fn movement_type(&self) -> MovementType {
        match self {
            MovementKind::Receipt { .. } => MovementType::Receipt,
            MovementKind::Issue => MovementType::Issue,
            MovementKind::Transfer { .. } => MovementType::Transfer,
            MovementKind::Adjustment => MovementType::Adjustment,
            MovementKind::Count => MovementType::Count,
            MovementKind::Damage => MovementType::Damage,
            MovementKind::Return => MovementType::Return,
            MovementKind::KitAssembly { .. } => MovementType::KitAssembly,
            MovementKind::OnOrder => MovementType::OnOrder,
        }
    }

    fn sign(&self) -> Sign {
        match self {
            MovementKind::Receipt { .. }
            | MovementKind::Return
            | MovementKind::Transfer {
                leg: TransferLeg::Reserve | TransferLeg::Release | TransferLeg::Receive { .. },
            }
            | MovementKind::KitAssembly {
                leg: KitLeg::KitReceipt { .. } | KitLeg::ComponentReceipt { .. },
            } => Sign::Positive,
            MovementKind::Issue
            | MovementKind::Transfer {
                leg: TransferLeg::Ship,
            }
            | MovementKind::KitAssembly {
                leg: KitLeg::ComponentIssue | KitLeg::KitIssue,
            } => Sign::Negative,
            MovementKind::Adjustment
            | MovementKind::Count
            | MovementKind::Damage
            | MovementKind::OnOrder => Sign::Either,
        }
    }

    /// Moves that only shift quantity between buckets carry no unit identity.
    pub fn is_bucket_move(&self) -> bool {
        matches!(
            self,
            MovementKind::Transfer {
                leg: TransferLeg::Reserve | TransferLeg::Release
            } | MovementKind::OnOrder
        )
    }

    /// Outbound consumption that counts as demand (forecasting, ABC).
    pub fn is_consumption(&self) -> bool {
        matches!(
            self,
            MovementKind::Issue
                | MovementKind::KitAssembly {
                    leg: KitLeg::ComponentIssue
                }
        )
    }

    /// Unit cost carried by priced inbound kinds.
    pub fn unit_cost(&self) -> Option<i64> {
        match self {
            MovementKind::Receipt { unit_cost }
            | MovementKind::Transfer {
                leg: TransferLeg::Receive { unit_cost },
            }
            | MovementKind::KitAssembly {
                leg: KitLeg::KitReceipt { unit_cost } | KitLeg::ComponentReceipt { unit_cost },
            } => Some(*unit_cost),
            _ => None,
        }
    }

    pub fn validate_quantity(&self, quantity: i64) -> DomainResult<()> {
        if quantity == 0 {
            return Err(DomainError::validation("movement quantity cannot be zero"));
        }
        match self.sign() {
            Sign::Positive if quantity < 0 => Err(DomainError::validation(format!(
                "{} movements require a positive quantity",
                self.movement_type().as_str()
            ))),
            Sign::Negative if quantity > 0 => Err(DomainError::validation(format!(
                "{} movements require a negative quantity",
                self.movement_type().as_str()
            ))),
            _ => Ok(()),
        }?;
        if let Some(cost) = self.unit_cost() {
            if cost < 0 {
                return Err(DomainError::validation("unit cost cannot be negative"));
            }
        }
        Ok(())
    }

    /// Bucket deltas produced by a movement of `quantity` units of this kind.
    pub fn effect(&self, quantity: i64) -> StockEffect {
        match self {
            MovementKind::Transfer {
                leg: TransferLeg::Reserve,
            } => StockEffect {
                available: -quantity,
                reserved: quantity,
                ..StockEffect::default()
            },
            MovementKind::Transfer {
                leg: TransferLeg::Release,
            } => StockEffect {
                available: quantity,
                reserved: -quantity,
                ..StockEffect::default()
            },
            MovementKind::Transfer {
                leg: TransferLeg::Ship,
            } => StockEffect {
                reserved: quantity,
                ..StockEffect::default()
            },
            MovementKind::Damage if quantity > 0 => StockEffect {
                available: -quantity,
                damaged: quantity,
                ..StockEffect::default()
            },
            MovementKind::Damage => StockEffect {
                damaged: quantity,
                ..StockEffect::default()
            },
            MovementKind::OnOrder => StockEffect {
                on_order: quantity,
                ..StockEffect::default()
            },
            _ => StockEffect {
                available: quantity,
                ..StockEffect::default()
            },
        }
    }
}

/// What caused a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Manual,
    PurchaseOrder,
    SalesOrder,
    TransferOrder,
    CycleCount,
    Kit,
    CustomerReturn,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub id: String,
}

impl Reference {
    pub fn new(kind: ReferenceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn manual(id: impl Into<String>) -> Self {
        Self::new(ReferenceKind::Manual, id)
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    /// Signed quantity as requested (see `MovementKind::effect` for bucket impact).
    pub quantity: i64,
    pub reference: Reference,
    pub serials: Vec<String>,
    pub batches: Vec<BatchAllocation>,
    /// Extended cost drawn from the layers by an outbound movement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawn_cost: Option<i64>,
    pub reason: Option<String>,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.item_id.clone(), self.location_id.clone())
    }

    pub fn movement_type(&self) -> MovementType {
        self.kind.movement_type()
    }

    pub fn effect(&self) -> StockEffect {
        self.kind.effect(self.quantity)
    }

    pub fn unit_cost(&self) -> Option<i64> {
        self.kind.unit_cost()
    }
}

impl Event for StockMovement {
    fn event_type(&self) -> &'static str {
        match self.movement_type() {
            MovementType::Receipt => "inventory.stock.receipt",
            MovementType::Issue => "inventory.stock.issue",
            MovementType::Transfer => "inventory.stock.transfer",
            MovementType::Adjustment => "inventory.stock.adjustment",
            MovementType::Count => "inventory.stock.count",
            MovementType::Damage => "inventory.stock.damage",
            MovementType::Return => "inventory.stock.return",
            MovementType::KitAssembly => "inventory.stock.kit_assembly",
            MovementType::OnOrder => "inventory.stock.on_order",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A movement request before it is stamped with id, actor and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementDraft {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    pub quantity: i64,
    pub reference: Reference,
    pub serials: Vec<String>,
    pub batches: Vec<BatchAllocation>,
    pub drawn_cost: Option<i64>,
    pub reason: Option<String>,
}

impl MovementDraft {
    pub fn new(
        item_id: ItemId,
        location_id: LocationId,
        kind: MovementKind,
        quantity: i64,
        reference: Reference,
    ) -> Self {
        Self {
            item_id,
            location_id,
            kind,
            quantity,
            reference,
            serials: Vec::new(),
            batches: Vec::new(),
            drawn_cost: None,
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

    pub fn with_drawn_cost(mut self, drawn_cost: Option<i64>) -> Self {
        self.drawn_cost = drawn_cost;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.item_id.clone(), self.location_id.clone())
    }

    /// Construction-time validation of the tagged payload.
    pub fn validate(&self) -> DomainResult<()> {
        self.kind.validate_quantity(self.quantity)?;
        let units = self.quantity.abs();

        if self.kind.is_bucket_move() && (!self.serials.is_empty() || !self.batches.is_empty()) {
            return Err(DomainError::validation(format!(
                "{} movements cannot carry serials or batches",
                self.kind.movement_type().as_str()
            )));
        }

        if !self.serials.is_empty() {
            if self.serials.len() as i64 != units {
                return Err(DomainError::validation(format!(
                    "{} serials supplied for a movement of {units} units",
                    self.serials.len()
                )));
            }
            let mut seen = HashSet::new();
            for serial in &self.serials {
                if serial.trim().is_empty() {
                    return Err(DomainError::validation("serial number cannot be empty"));
                }
                if !seen.insert(serial.as_str()) {
                    return Err(DomainError::validation(format!(
                        "serial {serial} listed more than once"
                    )));
                }
            }
        }

        if !self.batches.is_empty() {
            if self.batches.iter().any(|b| b.quantity <= 0) {
                return Err(DomainError::validation("batch quantities must be positive"));
            }
            let total: i64 = self.batches.iter().map(|b| b.quantity).sum();
            if total != units {
                return Err(DomainError::validation(format!(
                    "batch quantities sum to {total} but the movement moves {units} units"
                )));
            }
        }

        Ok(())
    }

    pub fn into_movement(
        self,
        id: MovementId,
        actor: ActorId,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<StockMovement> {
        self.validate()?;
        Ok(StockMovement {
            id,
            item_id: self.item_id,
            location_id: self.location_id,
            kind: self.kind,
            quantity: self.quantity,
            reference: self.reference,
            serials: self.serials,
            batches: self.batches,
            drawn_cost: self.drawn_cost,
            reason: self.reason,
            actor,
            occurred_at,
        })
    }
}
