use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::info;

use stockledger_core::{ActorId, DomainError, DomainResult, ItemId, LocationId};
use stockledger_inventory::{
    kit::plan_assembly, ComponentCost, ComponentPick, Item, KitComponent, KitCostBreakdown, KitLeg,
    MovementKind, NewItem, PriceSnapshot, ProratedComponent, Reference, ReferenceKind, StockKey,
    StockMovement,
};

use super::InventoryEngine;
use crate::ledger::AdjustRequest;
use crate::store::{ChangeSet, InventoryStore, Write};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyResult {
    pub kit_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub picks: Vec<ComponentPick>,
    pub cost: KitCostBreakdown,
    pub movements: Vec<StockMovement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisassemblyResult {
    pub kit_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    /// Value of the kits taken apart.
    pub kit_value: i64,
    /// Components received back with their share of `kit_value`.
    pub components: Vec<ProratedComponent>,
    pub movements: Vec<StockMovement>,
}

fn kit_reference(kit_id: &ItemId) -> Reference {
    Reference::new(ReferenceKind::Kit, kit_id.as_str())
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    /// Components (and their substitutes) must exist and must not be
    /// serial- or batch-tracked.
    pub fn create_kit(&self, new: NewItem, components: Vec<KitComponent>) -> DomainResult<Item> {
        let now = self.now();
        let mut kit = Item::create(new, self.config.default_costing, now)?;
        kit.make_kit(components, now)?;
        for component_id in kit.component_ids() {
            let component = self.require_item(component_id)?.value;
            if component.is_tracked() {
                return Err(DomainError::validation(format!(
                    "component {component_id} is serial- or batch-tracked and cannot go into a kit"
                )));
            }
        }
        if self.store.get_item(&kit.id)?.is_some() {
            return Err(DomainError::validation(format!("item {} already exists", kit.id)));
        }
        self.ensure_unique_sku(&kit.id, &kit.sku)?;

        self.store.commit(ChangeSet {
            items: vec![Write::insert(kit.clone())],
            ..ChangeSet::default()
        })?;
        info!(kit_id = %kit.id, components = kit.components.len(), "kit created");
        Ok(kit)
    }

    fn require_kit(&self, kit_id: &ItemId) -> DomainResult<Item> {
        let kit = self.require_item(kit_id)?.value;
        if !kit.is_kit {
            return Err(DomainError::validation(format!("item {kit_id} is not a kit")));
        }
        Ok(kit)
    }

    /// Issue the components and receive `quantity` kits, priced from the
    /// component costs drawn in this same transaction.
    pub fn assemble_kit(
        &self,
        kit_id: &ItemId,
        location_id: &LocationId,
        quantity: i64,
        actor: &ActorId,
    ) -> DomainResult<AssemblyResult> {
        let kit = self.require_kit(kit_id)?;
        let mut keys: BTreeSet<StockKey> = kit
            .component_ids()
            .map(|id| StockKey::new(id.clone(), location_id.clone()))
            .collect();
        keys.insert(StockKey::new(kit_id.clone(), location_id.clone()));

        let mut tx = self.ledger.begin(keys, actor)?;
        let mut available: HashMap<ItemId, i64> = HashMap::new();
        for component_id in kit.component_ids() {
            let key = StockKey::new(component_id.clone(), location_id.clone());
            available.insert(component_id.clone(), tx.stock(&key)?.available);
        }
        let picks = plan_assembly(&kit, location_id, quantity, |id| {
            available.get(id).copied().unwrap_or(0)
        })?;

        let mut prices = PriceSnapshot::new();
        for pick in &picks {
            let posting = tx.adjust(AdjustRequest::new(
                pick.item_id.clone(),
                location_id.clone(),
                MovementKind::KitAssembly {
                    leg: KitLeg::ComponentIssue,
                },
                -pick.quantity,
                kit_reference(kit_id),
            ))?;
            prices.insert(pick.item_id.clone(), posting.unit_cost.unwrap_or(0));
        }
        let cost = KitCostBreakdown::from_picks(kit_id.clone(), &picks, &prices, tx.now())?;
        tx.adjust(AdjustRequest::new(
            kit_id.clone(),
            location_id.clone(),
            MovementKind::KitAssembly {
                leg: KitLeg::KitReceipt {
                    unit_cost: cost.unit_cost,
                },
            },
            quantity,
            kit_reference(kit_id),
        ))?;

        let version = self.store.get_kit_cost(kit_id)?.map_or(0, |row| row.version);
        tx.put_kit_cost(Write::update(cost.clone(), version));
        let movements = tx.movements().to_vec();
        tx.commit()?;

        info!(
            %kit_id,
            %location_id,
            quantity,
            unit_cost = cost.unit_cost,
            components = picks.len(),
            "kits assembled"
        );
        Ok(AssemblyResult {
            kit_id: kit_id.clone(),
            location_id: location_id.clone(),
            quantity,
            picks,
            cost,
            movements,
        })
    }

    /// Issue kits and receive their components back, splitting the kits'
    /// cost by each component's share of the last assembly cost.
    pub fn disassemble_kit(
        &self,
        kit_id: &ItemId,
        location_id: &LocationId,
        quantity: i64,
        actor: &ActorId,
    ) -> DomainResult<DisassemblyResult> {
        if quantity <= 0 {
            return Err(DomainError::validation("kit quantity must be positive"));
        }
        let kit = self.require_kit(kit_id)?;
        let breakdown = match self.store.get_kit_cost(kit_id)? {
            Some(row) => row.value,
            None => self.catalog_breakdown(&kit)?,
        };

        let mut keys: BTreeSet<StockKey> = breakdown
            .components
            .iter()
            .map(|c| StockKey::new(c.item_id.clone(), location_id.clone()))
            .collect();
        keys.insert(StockKey::new(kit_id.clone(), location_id.clone()));

        let mut tx = self.ledger.begin(keys, actor)?;
        let posting = tx.adjust(AdjustRequest::new(
            kit_id.clone(),
            location_id.clone(),
            MovementKind::KitAssembly {
                leg: KitLeg::KitIssue,
            },
            -quantity,
            kit_reference(kit_id),
        ))?;
        let kit_value = posting.cost.map_or(0, |draw| draw.total_cost);

        let components = breakdown.prorate(quantity, kit_value);
        for component in &components {
            for (units, unit_cost) in component.receipts() {
                tx.adjust(AdjustRequest::new(
                    component.item_id.clone(),
                    location_id.clone(),
                    MovementKind::KitAssembly {
                        leg: KitLeg::ComponentReceipt { unit_cost },
                    },
                    units,
                    kit_reference(kit_id),
                ))?;
            }
        }
        let movements = tx.movements().to_vec();
        tx.commit()?;

        info!(%kit_id, %location_id, quantity, kit_value, "kits disassembled");
        Ok(DisassemblyResult {
            kit_id: kit_id.clone(),
            location_id: location_id.clone(),
            quantity,
            kit_value,
            components,
            movements,
        })
    }

    /// Breakdown from catalog cost prices, for kits never assembled here.
    fn catalog_breakdown(&self, kit: &Item) -> DomainResult<KitCostBreakdown> {
        let mut components = Vec::with_capacity(kit.components.len());
        for component in &kit.components {
            let unit_cost = self.require_item(&component.item_id)?.value.cost_price;
            components.push(ComponentCost {
                item_id: component.item_id.clone(),
                quantity_per_kit: component.quantity,
                unit_cost,
                extended_cost: unit_cost * component.quantity,
            });
        }
        Ok(KitCostBreakdown {
            kit_id: kit.id.clone(),
            unit_cost: components.iter().map(|c| c.extended_cost).sum(),
            components,
            computed_at: self.now(),
        })
    }
}
