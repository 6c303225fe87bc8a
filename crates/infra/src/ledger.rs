//! Stock ledger.
//!
//! [`LedgerTx::adjust`] is the only way quantities change. A transaction locks
//! every (item, location) key it will touch up front, stages all row changes
//! in memory and hands them to the store as one [`ChangeSet`]. Dropping a
//! transaction without committing discards everything it staged.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use stockledger_core::{ActorId, Clock, DomainError, DomainResult, ItemId, LocationId, MovementId};
use stockledger_events::Event;
use stockledger_inventory::{
    allocate, consume_exact, Batch, BatchAllocation, BatchPolicy, BatchReceipt, BatchStatus,
    CostDraw, CostLayers, CycleCount, Item, KitCostBreakdown, LocationStock, MovementDraft,
    MovementKind, Reference, SerialNumber, SerialStatus, StockKey, StockMovement, TransferLeg,
    TransferOrder,
};

use crate::store::{ChangeSet, InventoryStore, StoredEvent, UncommittedEvent, Write};

/// Per-key lock table.
///
/// A caller acquires all of its keys in one step (sorted, deduplicated), so two
/// transactions over overlapping key sets can never deadlock.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<BTreeSet<StockKey>>,
    released: Condvar,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, keys: impl IntoIterator<Item = StockKey>) -> DomainResult<KeyGuard<'_>> {
        let mut keys: Vec<StockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let poisoned = |_| DomainError::infrastructure("key lock table poisoned");
        let mut held = self.held.lock().map_err(poisoned)?;
        while keys.iter().any(|k| held.contains(k)) {
            held = self.released.wait(held).map_err(poisoned)?;
        }
        for key in &keys {
            held.insert(key.clone());
        }
        Ok(KeyGuard { locks: self, keys })
    }

    pub fn is_held(&self, key: &StockKey) -> bool {
        match self.held.lock() {
            Ok(held) => held.contains(key),
            Err(poisoned) => poisoned.into_inner().contains(key),
        }
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<StockKey>,
}

impl KeyGuard<'_> {
    pub fn keys(&self) -> &[StockKey] {
        &self.keys
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
        self.locks.released.notify_all();
    }
}

/// How an adjustment identifies the lots it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BatchSpec {
    /// Outbound: draw by the configured policy. Inbound: add to the newest
    /// usable lot at the location.
    #[default]
    Auto,
    /// Restrict the draw (or the top-up) to one lot.
    Pinned(String),
    /// Exact lot quantities.
    Allocations(Vec<BatchAllocation>),
    /// New or existing lots with their dates (inbound only).
    Receipts(Vec<BatchReceipt>),
}

/// Input to the adjustment primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustRequest {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    /// Signed: negative draws stock down.
    pub quantity: i64,
    pub reference: Reference,
    /// Empty on outbound serialized moves means "oldest available units".
    pub serials: Vec<String>,
    pub batches: BatchSpec,
    pub reason: Option<String>,
}

impl AdjustRequest {
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
            batches: BatchSpec::Auto,
            reason: None,
        }
    }

    pub fn with_serials(mut self, serials: Vec<String>) -> Self {
        self.serials = serials;
        self
    }

    pub fn with_batches(mut self, batches: BatchSpec) -> Self {
        self.batches = batches;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.item_id.clone(), self.location_id.clone())
    }
}

/// Result of one successful adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Posting {
    pub movement: StockMovement,
    /// The row after this movement (staged until the transaction commits).
    pub stock: LocationStock,
    /// Layers consumed by an outbound movement.
    pub cost: Option<CostDraw>,
    /// Per-unit cost booked in or drawn out.
    pub unit_cost: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Moves quantity between buckets; no unit identity, no cost.
    Bucket,
    Inbound,
    Outbound,
    /// `available → damaged`; stays on hand at its cost.
    Damage,
    /// Damaged units leave the books; lots were drawn when they were damaged.
    WriteOff,
}

impl Flow {
    fn of(kind: &MovementKind, quantity: i64) -> Self {
        match kind {
            MovementKind::Transfer {
                leg: TransferLeg::Reserve | TransferLeg::Release,
            }
            | MovementKind::OnOrder => Flow::Bucket,
            MovementKind::Damage if quantity > 0 => Flow::Damage,
            MovementKind::Damage => Flow::WriteOff,
            _ if quantity > 0 => Flow::Inbound,
            _ => Flow::Outbound,
        }
    }
}

/// Serial states an outbound, damaging or write-off movement walks a unit through.
fn outbound_serial_path(flow: Flow, kind: &MovementKind) -> &'static [SerialStatus] {
    match (flow, kind) {
        (Flow::Damage, _) => &[SerialStatus::Damaged],
        (Flow::WriteOff, _) => &[SerialStatus::WrittenOff],
        (_, MovementKind::Issue | MovementKind::KitAssembly { .. }) => {
            &[SerialStatus::Reserved, SerialStatus::Sold]
        }
        (_, MovementKind::Transfer { .. }) => &[SerialStatus::Reserved],
        _ => &[SerialStatus::WrittenOff],
    }
}

fn is_on_hand(status: SerialStatus) -> bool {
    matches!(status, SerialStatus::Available | SerialStatus::Returned)
}

/// Serial states a movement of this flow may draw from.
fn drawable(flow: Flow, status: SerialStatus) -> bool {
    match flow {
        Flow::WriteOff => status == SerialStatus::Damaged,
        _ => is_on_hand(status),
    }
}

#[derive(Debug, Clone)]
struct Staged<T> {
    value: T,
    version: u64,
    dirty: bool,
}

impl<T> Staged<T> {
    fn clean(value: T, version: u64) -> Self {
        Self {
            value,
            version,
            dirty: false,
        }
    }

    fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }
}

#[derive(Debug, Clone)]
struct StagedBatches {
    rows: Vec<Batch>,
    original: BTreeMap<String, (Batch, u64)>,
}

/// The stock ledger handle: store, key locks, clock and lot policy.
pub struct StockLedger<S> {
    store: Arc<S>,
    locks: Arc<KeyLocks>,
    clock: Arc<dyn Clock>,
    batch_policy: BatchPolicy,
}

impl<S> Clone for StockLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            clock: Arc::clone(&self.clock),
            batch_policy: self.batch_policy,
        }
    }
}

impl<S> StockLedger<S>
where
    S: InventoryStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, batch_policy: BatchPolicy) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::new()),
            clock,
            batch_policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open a transaction over `keys`, blocking until all are free.
    pub fn begin(
        &self,
        keys: impl IntoIterator<Item = StockKey>,
        actor: &ActorId,
    ) -> DomainResult<LedgerTx<'_, S>> {
        let guard = self.locks.acquire(keys)?;
        let locked = guard.keys().iter().cloned().collect();
        Ok(LedgerTx {
            ledger: self,
            _guard: guard,
            locked,
            actor: actor.clone(),
            now: self.clock.now(),
            items: HashMap::new(),
            stock: BTreeMap::new(),
            serials: BTreeMap::new(),
            batches: BTreeMap::new(),
            layers: BTreeMap::new(),
            changes: ChangeSet::default(),
            postings: 0,
        })
    }

    /// Single-line convenience: lock, adjust, commit.
    pub fn adjust(&self, request: AdjustRequest, actor: &ActorId) -> DomainResult<Posting> {
        let mut tx = self.begin([request.key()], actor)?;
        let posting = tx.adjust(request)?;
        tx.commit()?;
        Ok(posting)
    }
}

/// One ledger transaction. See the module docs.
pub struct LedgerTx<'a, S> {
    ledger: &'a StockLedger<S>,
    _guard: KeyGuard<'a>,
    locked: BTreeSet<StockKey>,
    actor: ActorId,
    now: DateTime<Utc>,
    items: HashMap<ItemId, Item>,
    stock: BTreeMap<StockKey, Staged<LocationStock>>,
    serials: BTreeMap<(ItemId, String), Staged<SerialNumber>>,
    batches: BTreeMap<StockKey, StagedBatches>,
    layers: BTreeMap<StockKey, Staged<CostLayers>>,
    changes: ChangeSet,
    postings: usize,
}

impl<'a, S> LedgerTx<'a, S>
where
    S: InventoryStore,
{
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        self.ledger.batch_policy
    }

    /// Movements staged so far, in order.
    pub fn movements(&self) -> &[StockMovement] {
        &self.changes.movements
    }

    fn ensure_locked(&self, key: &StockKey) -> DomainResult<()> {
        if self.locked.contains(key) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "{key} is not locked by this transaction"
            )))
        }
    }

    pub fn item(&mut self, item_id: &ItemId) -> DomainResult<Item> {
        if let Some(item) = self.items.get(item_id) {
            return Ok(item.clone());
        }
        let item = self
            .ledger
            .store
            .get_item(item_id)?
            .ok_or_else(|| DomainError::not_found("item", item_id))?
            .value;
        self.items.insert(item_id.clone(), item.clone());
        Ok(item)
    }

    fn stock_mut(&mut self, key: &StockKey) -> DomainResult<&mut Staged<LocationStock>> {
        let ledger = self.ledger;
        match self.stock.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let staged = match ledger.store.get_stock(key)? {
                    Some(row) => Staged::clean(row.value, row.version),
                    None => Staged::clean(LocationStock::empty(key), 0),
                };
                Ok(e.insert(staged))
            }
        }
    }

    fn layers_mut(&mut self, key: &StockKey) -> DomainResult<&mut Staged<CostLayers>> {
        let ledger = self.ledger;
        match self.layers.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let staged = match ledger.store.get_cost_layers(key)? {
                    Some(row) => Staged::clean(row.value, row.version),
                    None => Staged::clean(CostLayers::new(key.clone()), 0),
                };
                Ok(e.insert(staged))
            }
        }
    }

    fn batches_mut(&mut self, key: &StockKey) -> DomainResult<&mut StagedBatches> {
        let ledger = self.ledger;
        match self.batches.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let stored = ledger.store.list_batches(key)?;
                let rows = stored.iter().map(|b| b.value.clone()).collect();
                let original = stored
                    .into_iter()
                    .map(|b| (b.value.lot_number.clone(), (b.value, b.version)))
                    .collect();
                Ok(e.insert(StagedBatches { rows, original }))
            }
        }
    }

    /// Current (staged) stock row; an untouched key reads as empty.
    pub fn stock(&mut self, key: &StockKey) -> DomainResult<LocationStock> {
        Ok(self.stock_mut(key)?.value.clone())
    }

    pub fn batches(&mut self, key: &StockKey) -> DomainResult<Vec<Batch>> {
        Ok(self.batches_mut(key)?.rows.clone())
    }

    pub fn cost_layers(&mut self, key: &StockKey) -> DomainResult<CostLayers> {
        Ok(self.layers_mut(key)?.value.clone())
    }

    fn serial(&mut self, item_id: &ItemId, serial: &str) -> DomainResult<Option<SerialNumber>> {
        let id = (item_id.clone(), serial.to_string());
        if let Some(staged) = self.serials.get(&id) {
            return Ok(Some(staged.value.clone()));
        }
        match self.ledger.store.get_serial(item_id, serial)? {
            Some(row) => {
                let value = row.value.clone();
                self.serials.insert(id, Staged::clean(row.value, row.version));
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serials of the key's item that are at the key's location right now.
    pub fn serials_at(&mut self, key: &StockKey) -> DomainResult<Vec<SerialNumber>> {
        let mut by_serial: BTreeMap<String, SerialNumber> = BTreeMap::new();
        for row in self.ledger.store.list_serials(key)? {
            let id = (row.value.item_id.clone(), row.value.serial.clone());
            self.serials
                .entry(id)
                .or_insert_with(|| Staged::clean(row.value.clone(), row.version));
            by_serial.insert(row.value.serial.clone(), row.value);
        }
        for ((item_id, serial), staged) in &self.serials {
            if item_id != &key.item_id {
                continue;
            }
            if staged.value.location_id == key.location_id {
                by_serial.insert(serial.clone(), staged.value.clone());
            } else {
                by_serial.remove(serial);
            }
        }
        Ok(by_serial.into_values().collect())
    }

    fn stage_serial(&mut self, serial: SerialNumber) {
        let id = (serial.item_id.clone(), serial.serial.clone());
        match self.serials.get_mut(&id) {
            Some(staged) => staged.set(serial),
            None => {
                let mut staged = Staged::clean(serial, 0);
                staged.dirty = true;
                self.serials.insert(id, staged);
            }
        }
    }

    /// The adjustment primitive.
    ///
    /// Validates the movement, checks the ledger buckets, walks serials and
    /// lots through their state machines and books cost layers. Nothing is
    /// staged unless every step succeeds.
    pub fn adjust(&mut self, request: AdjustRequest) -> DomainResult<Posting> {
        let key = request.key();
        self.ensure_locked(&key)?;
        let item = self.item(&request.item_id)?;
        let flow = Flow::of(&request.kind, request.quantity);
        let units = request.quantity.abs();
        let movement_id = MovementId::generate();
        let now = self.now;

        if !item.requires_serial && !request.serials.is_empty() {
            return Err(DomainError::validation(format!(
                "item {} does not track serial numbers",
                item.id
            )));
        }
        if !item.requires_batch && request.batches != BatchSpec::Auto {
            return Err(DomainError::validation(format!(
                "item {} does not track batches",
                item.id
            )));
        }
        if flow == Flow::Bucket && (!request.serials.is_empty() || request.batches != BatchSpec::Auto) {
            return Err(DomainError::validation(
                "reservation and on-order moves carry no serials or batches",
            ));
        }
        if flow == Flow::WriteOff && request.batches != BatchSpec::Auto {
            return Err(DomainError::validation(
                "write-offs carry no lots; damaged units left their lots when damaged",
            ));
        }

        let mut draft = MovementDraft::new(
            request.item_id.clone(),
            request.location_id.clone(),
            request.kind,
            request.quantity,
            request.reference.clone(),
        );
        draft.reason = request.reason.clone();

        // Ledger buckets first, so a plain shortage is reported as such.
        let preview = draft
            .clone()
            .into_movement(movement_id.clone(), self.actor.clone(), now)?;
        let mut stock = self.stock_mut(&key)?.value.clone();
        stock.apply(&preview)?;

        let mut serial_updates = Vec::new();
        let mut allocations = Vec::new();
        let mut staged_batches = None;
        let mut staged_layers = None;
        let mut cost = None;
        let mut unit_cost = None;

        if flow != Flow::Bucket {
            if item.requires_serial {
                serial_updates = self.plan_serials(&item, &key, &request, flow, units, &movement_id)?;
            }

            if item.requires_batch && flow != Flow::WriteOff {
                let mut rows = self.batches_mut(&key)?.rows.clone();
                allocations = match flow {
                    Flow::Inbound => receive_lots(&mut rows, &key, units, &request.batches, now)?,
                    _ => issue_lots(&mut rows, &key, units, &request.batches, self.ledger.batch_policy, now)?,
                };
                staged_batches = Some(rows);
            }

            let mut layers = self.layers_mut(&key)?.value.clone();
            let fallback = layers.average_cost().unwrap_or(item.cost_price);
            match flow {
                Flow::Inbound => {
                    let price = request.kind.unit_cost().unwrap_or(fallback);
                    if allocations.is_empty() {
                        layers.push(None, units, price, now);
                    } else {
                        for allocation in &allocations {
                            layers.push(Some(allocation.lot_number.clone()), allocation.quantity, price, now);
                        }
                    }
                    unit_cost = Some(price);
                    staged_layers = Some(layers);
                }
                Flow::Outbound | Flow::WriteOff => {
                    let draw = layers.consume(item.costing_method, units, &allocations, fallback);
                    unit_cost = Some(draw.unit_cost());
                    cost = Some(draw);
                    staged_layers = Some(layers);
                }
                Flow::Damage | Flow::Bucket => {}
            }

            if let [allocation] = allocations.as_slice() {
                for serial in serial_updates.iter_mut() {
                    if flow == Flow::Inbound && serial.lot_number.is_none() {
                        serial.lot_number = Some(allocation.lot_number.clone());
                    }
                }
            }
        }

        let movement = draft
            .with_serials(serial_updates.iter().map(|s| s.serial.clone()).collect())
            .with_batches(allocations)
            .with_drawn_cost(cost.as_ref().map(|c| c.total_cost))
            .into_movement(movement_id, self.actor.clone(), now)?;

        // Every check passed: stage.
        self.stock_mut(&key)?.set(stock.clone());
        if let Some(rows) = staged_batches {
            self.batches_mut(&key)?.rows = rows;
        }
        if let Some(layers) = staged_layers {
            self.layers_mut(&key)?.set(layers);
        }
        for serial in serial_updates {
            self.stage_serial(serial);
        }
        self.changes.movements.push(movement.clone());
        self.postings += 1;

        debug!(
            movement_id = %movement.id,
            item_id = %movement.item_id,
            location_id = %movement.location_id,
            movement_type = movement.movement_type().as_str(),
            quantity = movement.quantity,
            available = stock.available,
            "stock adjusted"
        );

        Ok(Posting {
            movement,
            stock,
            cost,
            unit_cost,
        })
    }

    fn plan_serials(
        &mut self,
        item: &Item,
        key: &StockKey,
        request: &AdjustRequest,
        flow: Flow,
        units: i64,
        movement_id: &MovementId,
    ) -> DomainResult<Vec<SerialNumber>> {
        let now = self.now;
        let mut out = Vec::with_capacity(units as usize);

        if flow == Flow::Inbound {
            if request.serials.is_empty() {
                return Err(DomainError::validation(format!(
                    "serial numbers are required to bring {} into stock",
                    item.id
                )));
            }
            for serial in &request.serials {
                let existing = self.serial(&item.id, serial)?;
                let unit = match (&request.kind, existing) {
                    (MovementKind::Transfer { .. }, Some(mut unit)) => {
                        unit.relocate(key.location_id.clone());
                        unit.transition(SerialStatus::Available, Some(movement_id), now)?;
                        unit
                    }
                    (MovementKind::Return, Some(mut unit)) => {
                        unit.transition(SerialStatus::Returned, Some(movement_id), now)?;
                        unit.relocate(key.location_id.clone());
                        unit
                    }
                    (MovementKind::Transfer { .. } | MovementKind::Return, None) => {
                        return Err(DomainError::not_found("serial", serial));
                    }
                    (_, Some(_)) => {
                        return Err(DomainError::validation(format!(
                            "serial {serial} already exists for item {}",
                            item.id
                        )));
                    }
                    (_, None) => SerialNumber::receive(item.id.clone(), serial.clone(), key.location_id.clone(), now)?,
                };
                out.push(unit);
            }
            return Ok(out);
        }

        let path = outbound_serial_path(flow, &request.kind);
        let mut units_out: Vec<SerialNumber> = if request.serials.is_empty() {
            let mut on_hand: Vec<SerialNumber> = self
                .serials_at(key)?
                .into_iter()
                .filter(|s| drawable(flow, s.status) && s.status.can_transition_to(path[0]))
                .collect();
            on_hand.sort_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.serial.cmp(&b.serial))
            });
            if (on_hand.len() as i64) < units {
                return Err(DomainError::validation(format!(
                    "only {} serialized units of {} can be drawn at {}",
                    on_hand.len(),
                    item.id,
                    key.location_id
                )));
            }
            on_hand.truncate(units as usize);
            on_hand
        } else {
            let mut picked = Vec::with_capacity(request.serials.len());
            for serial in &request.serials {
                let unit = self
                    .serial(&item.id, serial)?
                    .ok_or_else(|| DomainError::not_found("serial", serial))?;
                if unit.location_id != key.location_id {
                    return Err(DomainError::validation(format!(
                        "serial {serial} is at {}, not {}",
                        unit.location_id, key.location_id
                    )));
                }
                if !drawable(flow, unit.status) {
                    return Err(DomainError::transition("serial", unit.status, path[0]));
                }
                picked.push(unit);
            }
            picked
        };

        for unit in units_out.iter_mut() {
            for next in path {
                unit.transition(*next, Some(movement_id), now)?;
            }
        }
        out.append(&mut units_out);
        Ok(out)
    }

    /// Apply `f` to one lot at a locked key.
    pub fn update_batch(
        &mut self,
        key: &StockKey,
        lot_number: &str,
        f: impl FnOnce(&mut Batch) -> DomainResult<()>,
    ) -> DomainResult<Batch> {
        self.ensure_locked(key)?;
        let staged = self.batches_mut(key)?;
        let mut batch = staged
            .rows
            .iter()
            .find(|b| b.lot_number == lot_number)
            .cloned()
            .ok_or_else(|| DomainError::not_found("batch", lot_number))?;
        f(&mut batch)?;
        if let Some(row) = staged.rows.iter_mut().find(|b| b.lot_number == lot_number) {
            *row = batch.clone();
        }
        Ok(batch)
    }

    /// Apply `f` to one serial whose location is locked.
    pub fn update_serial(
        &mut self,
        item_id: &ItemId,
        serial: &str,
        f: impl FnOnce(&mut SerialNumber) -> DomainResult<()>,
    ) -> DomainResult<SerialNumber> {
        let mut unit = self
            .serial(item_id, serial)?
            .ok_or_else(|| DomainError::not_found("serial", serial))?;
        self.ensure_locked(&StockKey::new(item_id.clone(), unit.location_id.clone()))?;
        f(&mut unit)?;
        self.stage_serial(unit.clone());
        Ok(unit)
    }

    pub fn put_transfer(&mut self, write: Write<TransferOrder>) {
        self.changes.transfers.push(write);
    }

    pub fn put_count(&mut self, write: Write<CycleCount>) {
        self.changes.counts.push(write);
    }

    pub fn put_kit_cost(&mut self, write: Write<KitCostBreakdown>) {
        self.changes.kit_costs.push(write);
    }

    /// Stage audit events for `stream_id`.
    pub fn record<E>(&mut self, stream_id: &str, stream_type: &str, events: &[E]) -> DomainResult<()>
    where
        E: Event + Serialize,
    {
        for event in events {
            self.changes
                .events
                .push(UncommittedEvent::from_typed(stream_id, stream_type, event)?);
        }
        Ok(())
    }

    /// Hand everything staged to the store as one change set.
    pub fn commit(mut self) -> DomainResult<Vec<StoredEvent>> {
        let mut changes = std::mem::take(&mut self.changes);

        for staged in self.stock.values().filter(|s| s.dirty) {
            changes
                .stock
                .push(Write::update(staged.value.clone(), staged.version));
        }
        for staged in self.serials.values().filter(|s| s.dirty) {
            changes
                .serials
                .push(Write::update(staged.value.clone(), staged.version));
        }
        for staged in self.batches.values() {
            for row in &staged.rows {
                match staged.original.get(&row.lot_number) {
                    Some((original, _)) if original == row => {}
                    Some((_, version)) => changes.batches.push(Write::update(row.clone(), *version)),
                    None => changes.batches.push(Write::insert(row.clone())),
                }
            }
        }
        for staged in self.layers.values().filter(|s| s.dirty) {
            changes
                .cost_layers
                .push(Write::update(staged.value.clone(), staged.version));
        }

        let movements = changes.movements.len();
        let keys = self.locked.len();
        let events = self.ledger.store.commit(changes)?;
        info!(
            actor = %self.actor,
            movements,
            keys,
            events = events.len(),
            "ledger transaction committed"
        );
        Ok(events)
    }
}

/// Inbound lot handling: create or top up lots, return what was booked.
fn receive_lots(
    rows: &mut Vec<Batch>,
    key: &StockKey,
    units: i64,
    spec: &BatchSpec,
    now: DateTime<Utc>,
) -> DomainResult<Vec<BatchAllocation>> {
    match spec {
        BatchSpec::Receipts(receipts) => {
            let total: i64 = receipts.iter().map(|r| r.quantity).sum();
            if total != units {
                return Err(DomainError::validation(format!(
                    "lot quantities sum to {total} but {units} units arrive"
                )));
            }
            for receipt in receipts {
                receipt.validate()?;
                match rows.iter_mut().find(|b| b.lot_number == receipt.lot_number) {
                    Some(batch) => batch.replenish(receipt.quantity, now)?,
                    None => rows.push(Batch::receive(
                        key.item_id.clone(),
                        key.location_id.clone(),
                        receipt,
                        now,
                    )?),
                }
            }
            Ok(receipts.iter().map(BatchReceipt::allocation).collect())
        }
        BatchSpec::Allocations(allocations) => {
            for allocation in allocations {
                rows.iter_mut()
                    .find(|b| b.lot_number == allocation.lot_number)
                    .ok_or_else(|| DomainError::not_found("batch", &allocation.lot_number))?
                    .replenish(allocation.quantity, now)?;
            }
            Ok(allocations.clone())
        }
        BatchSpec::Pinned(lot) => {
            rows.iter_mut()
                .find(|b| &b.lot_number == lot)
                .ok_or_else(|| DomainError::not_found("batch", lot))?
                .replenish(units, now)?;
            Ok(vec![BatchAllocation::new(lot.clone(), units)])
        }
        BatchSpec::Auto => {
            let today = now.date_naive();
            let newest = rows
                .iter_mut()
                .filter(|b| b.status != BatchStatus::Expired && !b.is_past_expiry(today))
                .max_by(|a, b| a.received_at.cmp(&b.received_at))
                .ok_or_else(|| {
                    DomainError::validation(format!(
                        "a lot number is required to receive {} at {}",
                        key.item_id, key.location_id
                    ))
                })?;
            newest.replenish(units, now)?;
            Ok(vec![BatchAllocation::new(newest.lot_number.clone(), units)])
        }
    }
}

/// Outbound lot handling: draw by policy, pinned lot or exact allocations.
fn issue_lots(
    rows: &mut [Batch],
    key: &StockKey,
    units: i64,
    spec: &BatchSpec,
    policy: BatchPolicy,
    now: DateTime<Utc>,
) -> DomainResult<Vec<BatchAllocation>> {
    match spec {
        BatchSpec::Auto => allocate(rows, key, units, policy, None, now),
        BatchSpec::Pinned(lot) => allocate(rows, key, units, policy, Some(lot), now),
        BatchSpec::Allocations(allocations) => {
            let total: i64 = allocations.iter().map(|a| a.quantity).sum();
            if total != units {
                return Err(DomainError::validation(format!(
                    "lot quantities sum to {total} but {units} units leave"
                )));
            }
            consume_exact(rows, allocations, now)?;
            Ok(allocations.clone())
        }
        BatchSpec::Receipts(_) => Err(DomainError::validation(
            "lot receipts can only accompany inbound movements",
        )),
    }
}
