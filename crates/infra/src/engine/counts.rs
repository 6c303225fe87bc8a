use std::collections::BTreeSet;

use tracing::{info, warn};
use uuid::Uuid;

use stockledger_analytics::{AbcClass, JobControl};
use stockledger_core::{execute, ActorId, AggregateRoot, CycleCountId, DomainError, DomainResult, ItemId, LocationId};
use stockledger_inventory::{
    ApproveVariance, CancelCycleCount, CompleteCycleCount, CountWarning, CreateCycleCount,
    CycleCount, CycleCountCommand, CycleCountCompleted, CycleCountEvent, CycleCountItem,
    CycleCountType, MovementKind, RecordCount, Reference, ReferenceKind, StartCycleCount, StockKey,
};

use super::{document_number, InventoryEngine};
use crate::ledger::{AdjustRequest, LedgerTx};
use crate::store::{InventoryStore, Versioned, Write};

pub const COUNT_STREAM_TYPE: &str = "inventory.cycle_count";

/// Which items a new count covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountSelection {
    /// Every item with stock on hand at the location.
    Full,
    Partial(Vec<ItemId>),
    /// Items at the location whose current ABC class is listed.
    Abc(Vec<AbcClass>),
    /// A sample of this many stocked items.
    Random(usize),
}

impl CountSelection {
    fn count_type(&self) -> CycleCountType {
        match self {
            CountSelection::Full => CycleCountType::Full,
            CountSelection::Partial(_) => CycleCountType::Partial,
            CountSelection::Abc(_) => CycleCountType::Abc,
            CountSelection::Random(_) => CycleCountType::Random,
        }
    }
}

fn stage<S: InventoryStore>(
    tx: &mut LedgerTx<'_, S>,
    count: &CycleCount,
    version: u64,
    events: &[CycleCountEvent],
) -> DomainResult<()> {
    tx.put_count(Write::update(count.clone(), version));
    tx.record(count.id().as_str(), COUNT_STREAM_TYPE, events)
}

fn count_keys(count: &CycleCount) -> Vec<StockKey> {
    count
        .lines()
        .iter()
        .map(|l| StockKey::new(l.item_id.clone(), count.location_id().clone()))
        .collect()
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    pub fn get_cycle_count(&self, count_id: &CycleCountId) -> DomainResult<CycleCount> {
        Ok(self.load_count(count_id)?.value)
    }

    fn load_count(&self, count_id: &CycleCountId) -> DomainResult<Versioned<CycleCount>> {
        self.store
            .get_count(count_id)?
            .ok_or_else(|| DomainError::not_found("cycle count", count_id))
    }

    /// Serialized items are reconciled unit by unit and never appear on a
    /// quantity count.
    fn select_count_items(&self, location_id: &LocationId, selection: &CountSelection) -> DomainResult<Vec<ItemId>> {
        let counted_here = |item_id: &ItemId| -> DomainResult<bool> {
            let item = self.require_item(item_id)?.value;
            Ok(item.active && !item.requires_serial && !item.is_kit)
        };
        let rows = self.store.list_stock(Some(location_id))?;
        let mut stocked = Vec::new();
        for row in rows.iter().filter(|r| r.on_hand > 0) {
            if counted_here(&row.item_id)? {
                stocked.push(row.item_id.clone());
            }
        }

        let items = match selection {
            CountSelection::Full => stocked,
            CountSelection::Partial(items) => {
                for item_id in items {
                    let item = self.require_item(item_id)?.value;
                    if item.requires_serial {
                        return Err(DomainError::validation(format!(
                            "item {item_id} is serialized; count it by serial number"
                        )));
                    }
                }
                items.clone()
            }
            CountSelection::Abc(classes) => {
                let analysis = self.perform_abc_analysis(&JobControl::new())?;
                let wanted: BTreeSet<ItemId> = analysis.items_in(classes).into_iter().collect();
                let mut selected = Vec::new();
                for row in &rows {
                    if wanted.contains(&row.item_id) && counted_here(&row.item_id)? {
                        selected.push(row.item_id.clone());
                    }
                }
                selected
            }
            CountSelection::Random(n) => {
                let mut keyed: Vec<(Uuid, ItemId)> =
                    stocked.into_iter().map(|id| (Uuid::new_v4(), id)).collect();
                keyed.sort();
                keyed.into_iter().take(*n).map(|(_, id)| id).collect()
            }
        };
        if items.is_empty() {
            return Err(DomainError::validation(format!(
                "no items at {location_id} match the count selection"
            )));
        }
        Ok(items)
    }

    pub fn create_cycle_count(
        &self,
        location_id: &LocationId,
        selection: CountSelection,
        variance_threshold: Option<f64>,
        assignees: Vec<ActorId>,
        actor: &ActorId,
    ) -> DomainResult<CycleCount> {
        let items = self.select_count_items(location_id, &selection)?;
        let now = self.now();
        let count_id = CycleCountId::generate();
        let mut count = CycleCount::empty(count_id.clone());
        let events = execute(
            &mut count,
            &CycleCountCommand::Create(CreateCycleCount {
                count_id: count_id.clone(),
                number: document_number("CC", now, count_id.as_str()),
                location_id: location_id.clone(),
                count_type: selection.count_type(),
                variance_threshold: variance_threshold.unwrap_or(self.config.default_variance_threshold),
                items,
                assignees,
                created_by: actor.clone(),
                occurred_at: now,
            }),
        )?;

        let mut tx = self.ledger.begin(Vec::new(), actor)?;
        stage(&mut tx, &count, 0, &events)?;
        tx.commit()?;
        info!(
            count_id = %count_id,
            number = count.number(),
            location_id = %location_id,
            count_type = ?count.count_type(),
            lines = count.lines().len(),
            "cycle count created"
        );
        Ok(count)
    }

    /// `planned → in_progress`, freezing each line's expected quantity.
    pub fn start_cycle_count(&self, count_id: &CycleCountId, actor: &ActorId) -> DomainResult<CycleCount> {
        let current = self.load_count(count_id)?;
        let mut count = current.value;

        let mut tx = self.ledger.begin(count_keys(&count), actor)?;
        let mut expected = Vec::with_capacity(count.lines().len());
        for key in count_keys(&count) {
            let on_hand = tx.stock(&key)?.on_hand;
            expected.push((key.item_id, on_hand));
        }
        let events = execute(
            &mut count,
            &CycleCountCommand::Start(StartCycleCount {
                count_id: count_id.clone(),
                expected,
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &count, current.version, &events)?;
        tx.commit()?;
        info!(count_id = %count_id, "cycle count started");
        Ok(count)
    }

    pub fn record_count(
        &self,
        count_id: &CycleCountId,
        item_id: &ItemId,
        counted_quantity: i64,
        actor: &ActorId,
    ) -> DomainResult<CycleCountItem> {
        let current = self.load_count(count_id)?;
        let mut count = current.value;
        let mut tx = self.ledger.begin(Vec::new(), actor)?;
        let events = execute(
            &mut count,
            &CycleCountCommand::RecordCount(RecordCount {
                count_id: count_id.clone(),
                item_id: item_id.clone(),
                counted_quantity,
                counted_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &count, current.version, &events)?;
        tx.commit()?;

        let line = count
            .line(item_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("cycle count line", item_id))?;
        info!(
            count_id = %count_id,
            %item_id,
            counted_quantity,
            variance = line.variance,
            variance_pct = line.variance_pct,
            status = ?line.status,
            "count recorded"
        );
        Ok(line)
    }

    /// Second sign-off for a line whose variance exceeded the threshold.
    pub fn approve_count_variance(
        &self,
        count_id: &CycleCountId,
        item_id: &ItemId,
        actor: &ActorId,
    ) -> DomainResult<CycleCountItem> {
        let current = self.load_count(count_id)?;
        let mut count = current.value;
        let mut tx = self.ledger.begin(Vec::new(), actor)?;
        let events = execute(
            &mut count,
            &CycleCountCommand::ApproveVariance(ApproveVariance {
                count_id: count_id.clone(),
                item_id: item_id.clone(),
                approved_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &count, current.version, &events)?;
        tx.commit()?;
        info!(count_id = %count_id, %item_id, approved_by = %actor, "count variance approved");
        count
            .line(item_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("cycle count line", item_id))
    }

    /// Book one count adjustment per resolved non-zero variance. A shortfall
    /// writes off damaged units first, then draws available. Whatever the
    /// ledger cannot book (reserved units, unusable lots) comes back as a
    /// warning alongside unresolved and uncounted lines.
    pub fn complete_cycle_count(&self, count_id: &CycleCountId, actor: &ActorId) -> DomainResult<CycleCountCompleted> {
        let current = self.load_count(count_id)?;
        let mut count = current.value;

        let mut tx = self.ledger.begin(count_keys(&count), actor)?;
        let mut events = execute(
            &mut count,
            &CycleCountCommand::Complete(CompleteCycleCount {
                count_id: count_id.clone(),
                completed_by: actor.clone(),
                occurred_at: tx.now(),
            }),
        )?;
        let completed = events
            .iter_mut()
            .find_map(|e| match e {
                CycleCountEvent::Completed(done) => Some(done),
                _ => None,
            })
            .ok_or_else(|| DomainError::infrastructure("cycle count completion emitted no result"))?;

        let reason = format!("cycle count {}", count.number());
        let reference = Reference::new(ReferenceKind::CycleCount, count_id.as_str());
        let mut unposted = Vec::new();
        for adjustment in &completed.adjustments {
            let key = StockKey::new(adjustment.item_id.clone(), count.location_id().clone());
            let mut legs = Vec::with_capacity(2);
            if adjustment.variance > 0 {
                legs.push((MovementKind::Count, adjustment.variance));
            } else {
                let row = tx.stock(&key)?;
                let shortfall = -adjustment.variance;
                let from_damaged = shortfall.min(row.damaged);
                let from_available = (shortfall - from_damaged).min(row.available);
                if from_damaged > 0 {
                    legs.push((MovementKind::Damage, -from_damaged));
                }
                if from_available > 0 {
                    legs.push((MovementKind::Count, -from_available));
                }
                let rest = shortfall - from_damaged - from_available;
                if rest > 0 {
                    unposted.push(CountWarning::NotPosted {
                        item_id: adjustment.item_id.clone(),
                        quantity: -rest,
                        reason: format!("{rest} missing units exceed unreserved stock"),
                    });
                }
            }

            for (kind, quantity) in legs {
                let request = AdjustRequest::new(
                    key.item_id.clone(),
                    key.location_id.clone(),
                    kind,
                    quantity,
                    reference.clone(),
                )
                .with_reason(reason.clone());
                match tx.adjust(request) {
                    Ok(_) => {}
                    Err(err @ (DomainError::InsufficientStock(_) | DomainError::Validation(_))) => {
                        unposted.push(CountWarning::NotPosted {
                            item_id: key.item_id.clone(),
                            quantity,
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        completed.warnings.extend(unposted);
        let completed = completed.clone();

        stage(&mut tx, &count, current.version, &events)?;
        tx.commit()?;

        for warning in &completed.warnings {
            warn!(count_id = %count_id, item_id = %warning.item_id(), ?warning, "count line left unadjusted");
        }
        info!(
            count_id = %count_id,
            adjustments = completed.adjustments.len(),
            warnings = completed.warnings.len(),
            "cycle count completed"
        );
        Ok(completed)
    }

    pub fn cancel_cycle_count(
        &self,
        count_id: &CycleCountId,
        reason: Option<String>,
        actor: &ActorId,
    ) -> DomainResult<CycleCount> {
        let current = self.load_count(count_id)?;
        let mut count = current.value;
        let mut tx = self.ledger.begin(Vec::new(), actor)?;
        let events = execute(
            &mut count,
            &CycleCountCommand::Cancel(CancelCycleCount {
                count_id: count_id.clone(),
                reason,
                occurred_at: tx.now(),
            }),
        )?;
        stage(&mut tx, &count, current.version, &events)?;
        tx.commit()?;
        info!(count_id = %count_id, "cycle count cancelled");
        Ok(count)
    }
}
