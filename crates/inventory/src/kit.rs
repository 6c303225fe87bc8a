//! Kit assembly planning and costing.
//!
//! Planning is a pure pre-flight pass: it decides which item satisfies each
//! component (primary, then substitutes in order) against a snapshot of
//! available quantities, so a short component fails the assembly before any
//! ledger line is staged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId, LocationId, ShortageScope};

use crate::costing::div_round;
use crate::item::Item;

/// Unit costs frozen for the duration of one assembly transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    prices: BTreeMap<ItemId, i64>,
}

impl PriceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item_id: ItemId, unit_cost: i64) {
        self.prices.insert(item_id, unit_cost);
    }

    pub fn price(&self, item_id: &ItemId) -> DomainResult<i64> {
        self.prices
            .get(item_id)
            .copied()
            .ok_or_else(|| DomainError::not_found("price", item_id))
    }
}

/// The item chosen to satisfy one kit component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPick {
    /// Component as declared on the kit.
    pub component_id: ItemId,
    /// Item actually drawn (the component itself or a substitute).
    pub item_id: ItemId,
    pub quantity_per_kit: i64,
    /// Total units for the whole assembly.
    pub quantity: i64,
}

/// Choose the items that satisfy every component for `kit_quantity` kits.
///
/// `available` returns the issuable quantity of an item at `location_id`.
/// Optional components that cannot be satisfied are skipped; the first
/// required one fails with a ledger shortage naming the declared component.
pub fn plan_assembly(
    kit: &Item,
    location_id: &LocationId,
    kit_quantity: i64,
    available: impl Fn(&ItemId) -> i64,
) -> DomainResult<Vec<ComponentPick>> {
    if !kit.is_kit {
        return Err(DomainError::validation(format!("item {} is not a kit", kit.id)));
    }
    if kit_quantity <= 0 {
        return Err(DomainError::validation("kit quantity must be positive"));
    }

    let mut drawn: BTreeMap<&ItemId, i64> = BTreeMap::new();
    let mut picks = Vec::with_capacity(kit.components.len());

    for component in &kit.components {
        let needed = component.quantity * kit_quantity;
        let candidates = std::iter::once(&component.item_id).chain(component.substitutes.iter());

        let mut chosen = None;
        for candidate in candidates {
            let free = available(candidate) - drawn.get(candidate).copied().unwrap_or(0);
            if free >= needed {
                chosen = Some(candidate);
                break;
            }
        }

        match chosen {
            Some(item_id) => {
                *drawn.entry(item_id).or_insert(0) += needed;
                picks.push(ComponentPick {
                    component_id: component.item_id.clone(),
                    item_id: item_id.clone(),
                    quantity_per_kit: component.quantity,
                    quantity: needed,
                });
            }
            None if component.optional => continue,
            None => {
                let free = available(&component.item_id)
                    - drawn.get(&component.item_id).copied().unwrap_or(0);
                return Err(DomainError::insufficient(
                    ShortageScope::Ledger,
                    &component.item_id,
                    location_id,
                    needed,
                    free.max(0),
                ));
            }
        }
    }
    Ok(picks)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCost {
    pub item_id: ItemId,
    pub quantity_per_kit: i64,
    pub unit_cost: i64,
    pub extended_cost: i64,
}

/// Per-kit cost recorded at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitCostBreakdown {
    pub kit_id: ItemId,
    pub components: Vec<ComponentCost>,
    /// Sum of extended component costs for one kit.
    pub unit_cost: i64,
    pub computed_at: DateTime<Utc>,
}

impl KitCostBreakdown {
    pub fn from_picks(
        kit_id: ItemId,
        picks: &[ComponentPick],
        prices: &PriceSnapshot,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let mut components = Vec::with_capacity(picks.len());
        for pick in picks {
            let unit_cost = prices.price(&pick.item_id)?;
            components.push(ComponentCost {
                item_id: pick.item_id.clone(),
                quantity_per_kit: pick.quantity_per_kit,
                unit_cost,
                extended_cost: unit_cost * pick.quantity_per_kit,
            });
        }
        let unit_cost = components.iter().map(|c| c.extended_cost).sum();
        Ok(Self {
            kit_id,
            components,
            unit_cost,
            computed_at: at,
        })
    }

    /// Split `kit_value` (the cost of the kits being taken apart) across the
    /// components by their share of the assembly cost.
    ///
    /// The last component absorbs the rounding remainder, so the values always
    /// sum to `kit_value`. With a zero-cost breakdown the value is split by
    /// quantity share.
    pub fn prorate(&self, kit_quantity: i64, kit_value: i64) -> Vec<ProratedComponent> {
        let total_weight: i64 = if self.unit_cost > 0 {
            self.unit_cost
        } else {
            self.components.iter().map(|c| c.quantity_per_kit).sum()
        };

        let mut allocated = 0;
        let last = self.components.len().saturating_sub(1);
        self.components
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let weight = if self.unit_cost > 0 {
                    c.extended_cost
                } else {
                    c.quantity_per_kit
                };
                let value = if i == last {
                    kit_value - allocated
                } else {
                    div_round(kit_value as i128 * weight as i128, total_weight.max(1) as i128)
                };
                allocated += value;
                ProratedComponent {
                    item_id: c.item_id.clone(),
                    quantity: c.quantity_per_kit * kit_quantity,
                    value,
                }
            })
            .collect()
    }
}

/// One component's share of a disassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProratedComponent {
    pub item_id: ItemId,
    pub quantity: i64,
    /// Extended value, in minor units.
    pub value: i64,
}

impl ProratedComponent {
    /// `(units, unit_cost)` receipts whose extended cost sums to `value`
    /// exactly: the remainder goes one minor unit each onto some of the units.
    pub fn receipts(&self) -> Vec<(i64, i64)> {
        if self.quantity <= 0 {
            return Vec::new();
        }
        let base = self.value.div_euclid(self.quantity);
        let extra = self.value.rem_euclid(self.quantity);
        if extra == 0 {
            vec![(self.quantity, base)]
        } else {
            vec![(self.quantity - extra, base), (extra, base + 1)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costing::CostingMethod;
    use crate::item::{KitComponent, NewItem};

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn loc() -> LocationId {
        LocationId::from("wh-1")
    }

    fn kit(components: Vec<KitComponent>) -> Item {
        let mut item = Item::create(
            NewItem::new("KIT", "Gift box").with_id(ItemId::from("kit")),
            CostingMethod::Fifo,
            test_time(),
        )
        .unwrap();
        item.make_kit(components, test_time()).unwrap();
        item
    }

    fn stock(levels: &[(&str, i64)]) -> impl Fn(&ItemId) -> i64 {
        let map: BTreeMap<ItemId, i64> = levels
            .iter()
            .map(|(id, q)| (ItemId::from(*id), *q))
            .collect();
        move |id| map.get(id).copied().unwrap_or(0)
    }

    #[test]
    fn short_component_fails_with_its_name() {
        let kit = kit(vec![
            KitComponent::new(ItemId::from("a"), 1),
            KitComponent::new(ItemId::from("x"), 3),
        ]);
        let err = plan_assembly(&kit, &loc(), 2, stock(&[("a", 10), ("x", 5)])).unwrap_err();
        match err {
            DomainError::InsufficientStock(s) => {
                assert_eq!(s.item_id, ItemId::from("x"));
                assert_eq!(s.requested, 6);
                assert_eq!(s.available, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn substitutes_are_tried_in_order() {
        let kit = kit(vec![KitComponent::new(ItemId::from("a"), 2)
            .with_substitutes(vec![ItemId::from("a2"), ItemId::from("a3")])]);
        let picks = plan_assembly(&kit, &loc(), 2, stock(&[("a", 1), ("a2", 3), ("a3", 10)])).unwrap();
        assert_eq!(picks[0].item_id, ItemId::from("a3"));
        assert_eq!(picks[0].component_id, ItemId::from("a"));
        assert_eq!(picks[0].quantity, 4);
    }

    #[test]
    fn optional_components_are_skipped_when_short() {
        let kit = kit(vec![
            KitComponent::new(ItemId::from("a"), 1),
            KitComponent::new(ItemId::from("ribbon"), 1).optional(),
        ]);
        let picks = plan_assembly(&kit, &loc(), 3, stock(&[("a", 3)])).unwrap();
        assert_eq!(picks.len(), 1);
    }

    #[test]
    fn shared_substitute_is_not_double_counted() {
        let kit = kit(vec![
            KitComponent::new(ItemId::from("a"), 2).with_substitutes(vec![ItemId::from("s")]),
            KitComponent::new(ItemId::from("b"), 2).with_substitutes(vec![ItemId::from("s")]),
        ]);
        let err = plan_assembly(&kit, &loc(), 1, stock(&[("s", 3)])).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
    }

    #[test]
    fn breakdown_sums_component_costs_and_prorates() {
        let picks = vec![
            ComponentPick {
                component_id: ItemId::from("a"),
                item_id: ItemId::from("a"),
                quantity_per_kit: 1,
                quantity: 2,
            },
            ComponentPick {
                component_id: ItemId::from("b"),
                item_id: ItemId::from("b"),
                quantity_per_kit: 2,
                quantity: 4,
            },
        ];
        let mut prices = PriceSnapshot::new();
        prices.insert(ItemId::from("a"), 300);
        prices.insert(ItemId::from("b"), 100);
        let breakdown =
            KitCostBreakdown::from_picks(ItemId::from("kit"), &picks, &prices, test_time()).unwrap();
        assert_eq!(breakdown.unit_cost, 500);

        // Two kits now carried at 1200 total: a gets 60%, b gets 40%.
        let lines = breakdown.prorate(2, 1200);
        assert_eq!((lines[0].quantity, lines[0].value), (2, 720));
        assert_eq!((lines[1].quantity, lines[1].value), (4, 480));
        assert_eq!(lines[1].receipts(), vec![(4, 120)]);
    }

    #[test]
    fn prorated_values_keep_every_minor_unit() {
        let breakdown = KitCostBreakdown {
            kit_id: ItemId::from("kit"),
            components: vec![
                ComponentCost {
                    item_id: ItemId::from("a"),
                    quantity_per_kit: 3,
                    unit_cost: 1,
                    extended_cost: 3,
                },
                ComponentCost {
                    item_id: ItemId::from("b"),
                    quantity_per_kit: 3,
                    unit_cost: 1,
                    extended_cost: 3,
                },
            ],
            unit_cost: 6,
            computed_at: test_time(),
        };

        let lines = breakdown.prorate(1, 101);
        assert_eq!(lines.iter().map(|l| l.value).sum::<i64>(), 101);
        for line in &lines {
            let booked: i64 = line.receipts().iter().map(|(q, c)| q * c).sum();
            let units: i64 = line.receipts().iter().map(|(q, _)| q).sum();
            assert_eq!(booked, line.value);
            assert_eq!(units, line.quantity);
        }
        // 51 over 3 units: 17 each; 50 over 3 units: 16, 17, 17.
        assert_eq!(lines[0].receipts(), vec![(3, 17)]);
        assert_eq!(lines[1].receipts(), vec![(1, 16), (2, 17)]);
    }

    #[test]
    fn missing_price_is_reported() {
        let prices = PriceSnapshot::new();
        assert!(matches!(
            prices.price(&ItemId::from("zzz")),
            Err(DomainError::NotFound { .. })
        ));
    }
}
