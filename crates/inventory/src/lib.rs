//! Inventory domain module.
//!
//! This crate contains the business rules of the stock ledger, implemented
//! purely as deterministic domain logic (no IO, no storage, no clock).

pub mod batch;
pub mod costing;
pub mod cycle_count;
pub mod item;
pub mod kit;
pub mod movement;
pub mod serial;
pub mod stock;
pub mod transfer;

pub use batch::{
    allocate, consume_exact, Batch, BatchAllocation, BatchPolicy, BatchReceipt, BatchStatus,
};
pub use costing::{CostDraw, CostLayer, CostLayers, CostingMethod, LayerDraw};
pub use cycle_count::{
    ApproveVariance, CancelCycleCount, CompleteCycleCount, CountAdjustment, CountLineStatus,
    CountWarning, CreateCycleCount, CycleCount, CycleCountCommand, CycleCountCompleted,
    CycleCountEvent, CycleCountItem, CycleCountStatus, CycleCountType, RecordCount,
    StartCycleCount,
};
pub use item::{ForecastModel, Item, ItemUpdate, KitComponent, NewItem};
pub use kit::{ComponentCost, ComponentPick, KitCostBreakdown, PriceSnapshot, ProratedComponent};
pub use movement::{
    KitLeg, MovementDraft, MovementKind, MovementType, Reference, ReferenceKind, StockMovement,
    TransferLeg,
};
pub use serial::{SerialNumber, SerialStatus, SerialTransition};
pub use stock::{LocationStock, StockEffect, StockKey};
pub use transfer::{
    ApproveTransferOrder, CancelTransferOrder, CreateTransferOrder, ReceiveTransferOrder,
    ReceivedLine, ShipTransferOrder, ShippedLine, SubmitTransferOrder, TransferLineRequest,
    TransferOrder, TransferOrderCommand, TransferOrderEvent, TransferOrderItem, TransferStatus,
};
