//! Durable store boundary.
//!
//! The engine is written against [`InventoryStore`]; the only durability
//! contract is that a [`ChangeSet`] commits as a unit, so a movement and the
//! `LocationStock` row it updates survive together or not at all.

pub mod in_memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockledger_core::{
    CycleCountId, DomainError, ExpectedVersion, ItemId, LocationId, TransferOrderId,
};
use stockledger_events::{Event, EventEnvelope};
use stockledger_inventory::{
    Batch, CostLayers, CycleCount, Item, KitCostBreakdown, LocationStock, MovementType,
    SerialNumber, StockKey, StockMovement, TransferOrder,
};

pub use in_memory::InMemoryStore;

/// A stored row together with its optimistic-concurrency version.
///
/// Versions start at 1 on first write; a missing row has version 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// A row to write, guarded by the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Write<T> {
    pub value: T,
    pub expected: ExpectedVersion,
}

impl<T> Write<T> {
    pub fn new(value: T, expected: ExpectedVersion) -> Self {
        Self { value, expected }
    }

    /// Insert; fails if the row already exists.
    pub fn insert(value: T) -> Self {
        Self::new(value, ExpectedVersion::Exact(0))
    }

    /// Update the row read at `version`.
    pub fn update(value: T, version: u64) -> Self {
        Self::new(value, ExpectedVersion::Exact(version))
    }
}

/// An audit event ready to be appended (not yet assigned a sequence number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_type: String,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    pub fn from_typed<E>(
        stream_id: impl Into<String>,
        stream_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, StoreError>
    where
        E: Event + Serialize,
    {
        let payload =
            serde_json::to_value(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            event_id: Uuid::now_v7(),
            stream_id: stream_id.into(),
            stream_type: stream_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// An audit event with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_type: String,
    /// Monotonically increasing position in the stream, starting at 1.
    pub sequence_number: u64,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.stream_id.clone(),
            self.stream_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// Filter over the movement log. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementQuery {
    pub item_id: Option<ItemId>,
    pub location_id: Option<LocationId>,
    pub movement_type: Option<MovementType>,
    /// Inclusive lower bound on `occurred_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MovementQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_key(key: &StockKey) -> Self {
        Self {
            item_id: Some(key.item_id.clone()),
            location_id: Some(key.location_id.clone()),
            ..Self::default()
        }
    }

    pub fn item(mut self, item_id: ItemId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn of_type(mut self, movement_type: MovementType) -> Self {
        self.movement_type = Some(movement_type);
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, movement: &StockMovement) -> bool {
        self.item_id.as_ref().is_none_or(|id| id == &movement.item_id)
            && self
                .location_id
                .as_ref()
                .is_none_or(|id| id == &movement.location_id)
            && self
                .movement_type
                .is_none_or(|t| t == movement.movement_type())
            && self.from.is_none_or(|from| movement.occurred_at >= from)
            && self.to.is_none_or(|to| movement.occurred_at < to)
    }
}

/// Everything one ledger transaction writes.
///
/// Movements are appended before any row is written; all version checks run
/// before either.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub movements: Vec<StockMovement>,
    pub stock: Vec<Write<LocationStock>>,
    pub serials: Vec<Write<SerialNumber>>,
    pub batches: Vec<Write<Batch>>,
    pub cost_layers: Vec<Write<CostLayers>>,
    pub items: Vec<Write<Item>>,
    pub transfers: Vec<Write<TransferOrder>>,
    pub counts: Vec<Write<CycleCount>>,
    pub kit_costs: Vec<Write<KitCostBreakdown>>,
    pub events: Vec<UncommittedEvent>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
            && self.stock.is_empty()
            && self.serials.is_empty()
            && self.batches.is_empty()
            && self.cost_layers.is_empty()
            && self.items.is_empty()
            && self.transfers.is_empty()
            && self.counts.is_empty()
            && self.kit_costs.is_empty()
            && self.events.is_empty()
    }
}

/// Store operation error.
///
/// Infrastructure errors as opposed to domain errors: a stale write or a
/// backend failure, never a business-rule violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("duplicate movement: {0}")]
    DuplicateMovement(String),

    #[error("sku {0} is already in use")]
    DuplicateSku(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Concurrency(msg) => DomainError::ConcurrencyConflict(msg),
            err @ StoreError::DuplicateSku(_) => DomainError::Validation(err.to_string()),
            other => DomainError::Infrastructure(other.to_string()),
        }
    }
}

/// Abstract durable store for items, stock rows, unit identity, cost layers,
/// workflow aggregates, the movement log and the audit event log.
pub trait InventoryStore: Send + Sync {
    fn get_item(&self, item_id: &ItemId) -> Result<Option<Versioned<Item>>, StoreError>;

    fn list_items(&self) -> Result<Vec<Item>, StoreError>;

    fn get_stock(&self, key: &StockKey) -> Result<Option<Versioned<LocationStock>>, StoreError>;

    /// Every stock row, or only those at `location_id`.
    fn list_stock(&self, location_id: Option<&LocationId>) -> Result<Vec<LocationStock>, StoreError>;

    fn get_serial(
        &self,
        item_id: &ItemId,
        serial: &str,
    ) -> Result<Option<Versioned<SerialNumber>>, StoreError>;

    /// Serials of `key.item_id` currently at `key.location_id`.
    fn list_serials(&self, key: &StockKey) -> Result<Vec<Versioned<SerialNumber>>, StoreError>;

    fn list_batches(&self, key: &StockKey) -> Result<Vec<Versioned<Batch>>, StoreError>;

    fn all_batches(&self) -> Result<Vec<Batch>, StoreError>;

    fn get_cost_layers(&self, key: &StockKey) -> Result<Option<Versioned<CostLayers>>, StoreError>;

    fn list_cost_layers(&self) -> Result<Vec<CostLayers>, StoreError>;

    fn get_transfer(
        &self,
        order_id: &TransferOrderId,
    ) -> Result<Option<Versioned<TransferOrder>>, StoreError>;

    fn get_count(&self, count_id: &CycleCountId) -> Result<Option<Versioned<CycleCount>>, StoreError>;

    fn get_kit_cost(&self, kit_id: &ItemId) -> Result<Option<Versioned<KitCostBreakdown>>, StoreError>;

    /// Movements matching `query`, in append order.
    fn movements(&self, query: &MovementQuery) -> Result<Vec<StockMovement>, StoreError>;

    /// The per-key movement stream, sequence numbers starting at 1.
    fn movement_stream(&self, key: &StockKey) -> Result<Vec<EventEnvelope<StockMovement>>, StoreError>;

    fn has_movements(&self, item_id: &ItemId) -> Result<bool, StoreError>;

    fn load_stream(&self, stream_id: &str) -> Result<Vec<StoredEvent>, StoreError>;

    /// Apply every write in `changes` or none of them. Item SKUs stay unique
    /// across the catalog.
    fn commit(&self, changes: ChangeSet) -> Result<Vec<StoredEvent>, StoreError>;
}

impl<S> InventoryStore for std::sync::Arc<S>
where
    S: InventoryStore + ?Sized,
{
    fn get_item(&self, item_id: &ItemId) -> Result<Option<Versioned<Item>>, StoreError> {
        (**self).get_item(item_id)
    }

    fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        (**self).list_items()
    }

    fn get_stock(&self, key: &StockKey) -> Result<Option<Versioned<LocationStock>>, StoreError> {
        (**self).get_stock(key)
    }

    fn list_stock(&self, location_id: Option<&LocationId>) -> Result<Vec<LocationStock>, StoreError> {
        (**self).list_stock(location_id)
    }

    fn get_serial(
        &self,
        item_id: &ItemId,
        serial: &str,
    ) -> Result<Option<Versioned<SerialNumber>>, StoreError> {
        (**self).get_serial(item_id, serial)
    }

    fn list_serials(&self, key: &StockKey) -> Result<Vec<Versioned<SerialNumber>>, StoreError> {
        (**self).list_serials(key)
    }

    fn list_batches(&self, key: &StockKey) -> Result<Vec<Versioned<Batch>>, StoreError> {
        (**self).list_batches(key)
    }

    fn all_batches(&self) -> Result<Vec<Batch>, StoreError> {
        (**self).all_batches()
    }

    fn get_cost_layers(&self, key: &StockKey) -> Result<Option<Versioned<CostLayers>>, StoreError> {
        (**self).get_cost_layers(key)
    }

    fn list_cost_layers(&self) -> Result<Vec<CostLayers>, StoreError> {
        (**self).list_cost_layers()
    }

    fn get_transfer(
        &self,
        order_id: &TransferOrderId,
    ) -> Result<Option<Versioned<TransferOrder>>, StoreError> {
        (**self).get_transfer(order_id)
    }

    fn get_count(&self, count_id: &CycleCountId) -> Result<Option<Versioned<CycleCount>>, StoreError> {
        (**self).get_count(count_id)
    }

    fn get_kit_cost(&self, kit_id: &ItemId) -> Result<Option<Versioned<KitCostBreakdown>>, StoreError> {
        (**self).get_kit_cost(kit_id)
    }

    fn movements(&self, query: &MovementQuery) -> Result<Vec<StockMovement>, StoreError> {
        (**self).movements(query)
    }

    fn movement_stream(&self, key: &StockKey) -> Result<Vec<EventEnvelope<StockMovement>>, StoreError> {
        (**self).movement_stream(key)
    }

    fn has_movements(&self, item_id: &ItemId) -> Result<bool, StoreError> {
        (**self).has_movements(item_id)
    }

    fn load_stream(&self, stream_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).load_stream(stream_id)
    }

    fn commit(&self, changes: ChangeSet) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).commit(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_surface_as_retry_safe_domain_errors() {
        let err: DomainError = StoreError::Concurrency("stock row wh@x".into()).into();
        assert!(err.is_retry_safe());
        let err: DomainError = StoreError::Unavailable("disk full".into()).into();
        assert!(matches!(err, DomainError::Infrastructure(_)));
    }

    #[test]
    fn empty_query_matches_everything() {
        use stockledger_core::{ActorId, MovementId};
        use stockledger_inventory::{MovementDraft, MovementKind, Reference};

        let movement = MovementDraft::new(
            ItemId::from("a"),
            LocationId::from("wh"),
            MovementKind::Issue,
            -1,
            Reference::manual("t"),
        )
        .into_movement(MovementId::generate(), ActorId::from("u"), Utc::now())
        .unwrap();
        assert!(MovementQuery::all().matches(&movement));
        assert!(!MovementQuery::all()
            .location(LocationId::from("other"))
            .matches(&movement));
        assert!(MovementQuery::all()
            .of_type(MovementType::Issue)
            .matches(&movement));
    }
}
