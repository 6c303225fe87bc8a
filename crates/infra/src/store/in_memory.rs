use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use stockledger_core::{AggregateRoot, CycleCountId, ItemId, LocationId, MovementId, TransferOrderId};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    Batch, CostLayers, CycleCount, Item, KitCostBreakdown, LocationStock, SerialNumber, StockKey,
    StockMovement, TransferOrder,
};

use super::{
    ChangeSet, InventoryStore, MovementQuery, StoreError, StoredEvent, Versioned, Write,
};

/// Stream type of the per-key movement streams.
pub const MOVEMENT_STREAM_TYPE: &str = "inventory.stock";

#[derive(Debug, Clone)]
struct StoredMovement {
    event_id: Uuid,
    sequence_number: u64,
    movement: StockMovement,
}

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<ItemId, Versioned<Item>>,
    stock: BTreeMap<StockKey, Versioned<LocationStock>>,
    serials: BTreeMap<(ItemId, String), Versioned<SerialNumber>>,
    batches: BTreeMap<(StockKey, String), Versioned<Batch>>,
    cost_layers: BTreeMap<StockKey, Versioned<CostLayers>>,
    transfers: BTreeMap<TransferOrderId, Versioned<TransferOrder>>,
    counts: BTreeMap<CycleCountId, Versioned<CycleCount>>,
    kit_costs: BTreeMap<ItemId, Versioned<KitCostBreakdown>>,

    movements: Vec<StoredMovement>,
    movement_ids: HashSet<MovementId>,
    by_key: HashMap<StockKey, Vec<usize>>,

    streams: HashMap<String, Vec<StoredEvent>>,
}

/// In-memory store.
///
/// Intended for tests/dev. A single write lock makes every commit atomic:
/// all version checks run first, then movements are appended, then rows and
/// audit events are written.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

/// SKUs after the item writes land must not collide.
fn check_skus(rows: &BTreeMap<ItemId, Versioned<Item>>, writes: &[Write<Item>]) -> Result<(), StoreError> {
    if writes.is_empty() {
        return Ok(());
    }
    let mut skus: HashMap<&str, &ItemId> = rows
        .values()
        .filter(|row| !writes.iter().any(|w| w.value.id == row.value.id))
        .map(|row| (row.value.sku.as_str(), &row.value.id))
        .collect();
    for write in writes {
        if let Some(owner) = skus.insert(write.value.sku.as_str(), &write.value.id) {
            if owner != &write.value.id {
                return Err(StoreError::DuplicateSku(write.value.sku.clone()));
            }
        }
    }
    Ok(())
}

fn check<K, T>(
    table: &str,
    rows: &BTreeMap<K, Versioned<T>>,
    writes: &[Write<T>],
    key: impl Fn(&T) -> K,
) -> Result<(), StoreError>
where
    K: Ord + Debug,
{
    let mut seen = Vec::with_capacity(writes.len());
    for write in writes {
        let k = key(&write.value);
        let current = rows.get(&k).map_or(0, |row| row.version);
        if !write.expected.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "{table} {k:?}: expected {:?}, found version {current}",
                write.expected
            )));
        }
        if seen.contains(&k) {
            return Err(StoreError::Concurrency(format!(
                "{table} {k:?} written twice in one commit"
            )));
        }
        seen.push(k);
    }
    Ok(())
}

fn apply<K, T>(rows: &mut BTreeMap<K, Versioned<T>>, writes: Vec<Write<T>>, key: impl Fn(&T) -> K)
where
    K: Ord,
{
    for write in writes {
        let k = key(&write.value);
        let next = rows.get(&k).map_or(0, |row| row.version) + 1;
        rows.insert(k, Versioned::new(write.value, next));
    }
}

fn serial_key(serial: &SerialNumber) -> (ItemId, String) {
    (serial.item_id.clone(), serial.serial.clone())
}

fn batch_key(batch: &Batch) -> (StockKey, String) {
    (
        StockKey::new(batch.item_id.clone(), batch.location_id.clone()),
        batch.lot_number.clone(),
    )
}

impl InventoryStore for InMemoryStore {
    fn get_item(&self, item_id: &ItemId) -> Result<Option<Versioned<Item>>, StoreError> {
        Ok(self.read()?.items.get(item_id).cloned())
    }

    fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        Ok(self.read()?.items.values().map(|v| v.value.clone()).collect())
    }

    fn get_stock(&self, key: &StockKey) -> Result<Option<Versioned<LocationStock>>, StoreError> {
        Ok(self.read()?.stock.get(key).cloned())
    }

    fn list_stock(&self, location_id: Option<&LocationId>) -> Result<Vec<LocationStock>, StoreError> {
        Ok(self
            .read()?
            .stock
            .values()
            .filter(|row| location_id.is_none_or(|loc| &row.value.location_id == loc))
            .map(|row| row.value.clone())
            .collect())
    }

    fn get_serial(
        &self,
        item_id: &ItemId,
        serial: &str,
    ) -> Result<Option<Versioned<SerialNumber>>, StoreError> {
        Ok(self
            .read()?
            .serials
            .get(&(item_id.clone(), serial.to_string()))
            .cloned())
    }

    fn list_serials(&self, key: &StockKey) -> Result<Vec<Versioned<SerialNumber>>, StoreError> {
        Ok(self
            .read()?
            .serials
            .values()
            .filter(|s| s.value.item_id == key.item_id && s.value.location_id == key.location_id)
            .cloned()
            .collect())
    }

    fn list_batches(&self, key: &StockKey) -> Result<Vec<Versioned<Batch>>, StoreError> {
        Ok(self
            .read()?
            .batches
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, b)| b.clone())
            .collect())
    }

    fn all_batches(&self) -> Result<Vec<Batch>, StoreError> {
        Ok(self.read()?.batches.values().map(|b| b.value.clone()).collect())
    }

    fn get_cost_layers(&self, key: &StockKey) -> Result<Option<Versioned<CostLayers>>, StoreError> {
        Ok(self.read()?.cost_layers.get(key).cloned())
    }

    fn list_cost_layers(&self) -> Result<Vec<CostLayers>, StoreError> {
        Ok(self
            .read()?
            .cost_layers
            .values()
            .map(|l| l.value.clone())
            .collect())
    }

    fn get_transfer(
        &self,
        order_id: &TransferOrderId,
    ) -> Result<Option<Versioned<TransferOrder>>, StoreError> {
        Ok(self.read()?.transfers.get(order_id).cloned())
    }

    fn get_count(&self, count_id: &CycleCountId) -> Result<Option<Versioned<CycleCount>>, StoreError> {
        Ok(self.read()?.counts.get(count_id).cloned())
    }

    fn get_kit_cost(&self, kit_id: &ItemId) -> Result<Option<Versioned<KitCostBreakdown>>, StoreError> {
        Ok(self.read()?.kit_costs.get(kit_id).cloned())
    }

    fn movements(&self, query: &MovementQuery) -> Result<Vec<StockMovement>, StoreError> {
        let state = self.read()?;
        let limit = query.limit.unwrap_or(usize::MAX);
        let matching = state
            .movements
            .iter()
            .map(|m| &m.movement)
            .filter(|m| query.matches(m))
            .take(limit)
            .cloned()
            .collect();
        Ok(matching)
    }

    fn movement_stream(&self, key: &StockKey) -> Result<Vec<EventEnvelope<StockMovement>>, StoreError> {
        let state = self.read()?;
        let Some(indices) = state.by_key.get(key) else {
            return Ok(Vec::new());
        };
        Ok(indices
            .iter()
            .map(|&i| {
                let stored = &state.movements[i];
                EventEnvelope::new(
                    stored.event_id,
                    key.to_string(),
                    MOVEMENT_STREAM_TYPE,
                    stored.sequence_number,
                    stored.movement.clone(),
                )
            })
            .collect())
    }

    fn has_movements(&self, item_id: &ItemId) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .by_key
            .iter()
            .any(|(key, indices)| &key.item_id == item_id && !indices.is_empty()))
    }

    fn load_stream(&self, stream_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self
            .read()?
            .streams
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    fn commit(&self, changes: ChangeSet) -> Result<Vec<StoredEvent>, StoreError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.write()?;
        let state = &mut *guard;

        // Validate everything before touching anything.
        check("item", &state.items, &changes.items, |i| i.id.clone())?;
        check_skus(&state.items, &changes.items)?;
        check("stock", &state.stock, &changes.stock, LocationStock::key)?;
        check("serial", &state.serials, &changes.serials, serial_key)?;
        check("batch", &state.batches, &changes.batches, batch_key)?;
        check("cost layers", &state.cost_layers, &changes.cost_layers, |l| l.key.clone())?;
        check("transfer order", &state.transfers, &changes.transfers, |t| t.id().clone())?;
        check("cycle count", &state.counts, &changes.counts, |c| c.id().clone())?;
        check("kit cost", &state.kit_costs, &changes.kit_costs, |k| k.kit_id.clone())?;
        let mut incoming = HashSet::new();
        for movement in &changes.movements {
            if state.movement_ids.contains(&movement.id) || !incoming.insert(&movement.id) {
                return Err(StoreError::DuplicateMovement(movement.id.to_string()));
            }
        }

        // Movement log first, projections second.
        for movement in changes.movements {
            let key = movement.key();
            let index = state.movements.len();
            let positions = state.by_key.entry(key).or_default();
            positions.push(index);
            let sequence_number = positions.len() as u64;
            state.movement_ids.insert(movement.id.clone());
            state.movements.push(StoredMovement {
                event_id: Uuid::now_v7(),
                sequence_number,
                movement,
            });
        }

        apply(&mut state.stock, changes.stock, LocationStock::key);
        apply(&mut state.serials, changes.serials, serial_key);
        apply(&mut state.batches, changes.batches, batch_key);
        apply(&mut state.cost_layers, changes.cost_layers, |l| l.key.clone());
        apply(&mut state.items, changes.items, |i| i.id.clone());
        apply(&mut state.transfers, changes.transfers, |t| t.id().clone());
        apply(&mut state.counts, changes.counts, |c| c.id().clone());
        apply(&mut state.kit_costs, changes.kit_costs, |k| k.kit_id.clone());

        let mut committed = Vec::with_capacity(changes.events.len());
        for e in changes.events {
            let stream = state.streams.entry(e.stream_id.clone()).or_default();
            let stored = StoredEvent {
                event_id: e.event_id,
                stream_id: e.stream_id,
                stream_type: e.stream_type,
                sequence_number: stream.last().map_or(0, |last| last.sequence_number) + 1,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }
}
