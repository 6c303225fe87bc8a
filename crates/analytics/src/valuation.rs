//! On-hand inventory valuation from open cost layers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ItemId, LocationId};
use stockledger_inventory::{CostLayers, CostingMethod};

use crate::job::{AnalyticsJob, JobControl};
use crate::result::AnalyticsError;

/// Snapshot of one item/location handed to the valuation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationInput {
    pub item_id: ItemId,
    pub sku: String,
    pub location_id: LocationId,
    pub costing_method: CostingMethod,
    pub on_hand: i64,
    pub layers: CostLayers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationLine {
    pub item_id: ItemId,
    pub sku: String,
    pub location_id: LocationId,
    pub costing_method: CostingMethod,
    pub on_hand: i64,
    /// Units carried by open layers; differs from `on_hand` only if stock
    /// entered without a cost.
    pub layer_quantity: i64,
    pub value: i64,
    pub average_unit_cost: Option<i64>,
    pub open_layers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryValuation {
    pub as_of: DateTime<Utc>,
    pub lines: Vec<ValuationLine>,
    pub total_quantity: i64,
    pub total_value: i64,
    pub by_location: BTreeMap<LocationId, i64>,
    pub by_method: BTreeMap<String, i64>,
}

/// Sum of remaining layer quantity × layer cost, per item/location.
#[derive(Debug, Clone)]
pub struct ValuationJob {
    inputs: Vec<ValuationInput>,
    as_of: DateTime<Utc>,
}

impl ValuationJob {
    pub fn new(inputs: Vec<ValuationInput>, as_of: DateTime<Utc>) -> Self {
        Self { inputs, as_of }
    }
}

fn method_name(method: CostingMethod) -> &'static str {
    match method {
        CostingMethod::Fifo => "fifo",
        CostingMethod::Lifo => "lifo",
        CostingMethod::WeightedAverage => "weighted_average",
        CostingMethod::SpecificCost => "specific_cost",
    }
}

impl AnalyticsJob for ValuationJob {
    type Output = InventoryValuation;

    fn name(&self) -> &'static str {
        "inventory_valuation"
    }

    fn run(&self, control: &JobControl) -> Result<InventoryValuation, AnalyticsError> {
        let mut lines = Vec::with_capacity(self.inputs.len());
        let mut by_location = BTreeMap::new();
        let mut by_method = BTreeMap::new();

        for input in &self.inputs {
            control.checkpoint()?;
            let value = input.layers.value();
            *by_location.entry(input.location_id.clone()).or_insert(0) += value;
            *by_method
                .entry(method_name(input.costing_method).to_string())
                .or_insert(0) += value;
            lines.push(ValuationLine {
                item_id: input.item_id.clone(),
                sku: input.sku.clone(),
                location_id: input.location_id.clone(),
                costing_method: input.costing_method,
                on_hand: input.on_hand,
                layer_quantity: input.layers.quantity(),
                value,
                average_unit_cost: input.layers.average_cost(),
                open_layers: input.layers.layers.len(),
            });
        }

        lines.sort_by(|a, b| {
            a.item_id
                .cmp(&b.item_id)
                .then_with(|| a.location_id.cmp(&b.location_id))
        });
        Ok(InventoryValuation {
            as_of: self.as_of,
            total_quantity: lines.iter().map(|l| l.on_hand).sum(),
            total_value: lines.iter().map(|l| l.value).sum(),
            lines,
            by_location,
            by_method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_inventory::StockKey;

    fn input(item: &str, loc: &str, layers: &[(i64, i64)]) -> ValuationInput {
        let key = StockKey::new(ItemId::from(item), LocationId::from(loc));
        let mut l = CostLayers::new(key);
        for (qty, cost) in layers {
            l.push(None, *qty, *cost, Utc::now());
        }
        ValuationInput {
            item_id: ItemId::from(item),
            sku: item.to_uppercase(),
            location_id: LocationId::from(loc),
            costing_method: CostingMethod::Fifo,
            on_hand: layers.iter().map(|(q, _)| q).sum(),
            layers: l,
        }
    }

    #[test]
    fn totals_sum_layer_values() {
        let job = ValuationJob::new(
            vec![
                input("a", "wh1", &[(10, 100), (5, 120)]),
                input("b", "wh2", &[(3, 1000)]),
            ],
            Utc::now(),
        );
        let v = job.run(&JobControl::new()).unwrap();
        assert_eq!(v.total_value, 1000 + 600 + 3000);
        assert_eq!(v.total_quantity, 18);
        assert_eq!(v.by_location[&LocationId::from("wh1")], 1600);
        assert_eq!(v.lines[0].average_unit_cost, Some(107));
        assert_eq!(v.by_method["fifo"], 4600);
    }

    #[test]
    fn empty_location_values_to_zero() {
        let v = ValuationJob::new(vec![input("a", "wh1", &[])], Utc::now())
            .run(&JobControl::new())
            .unwrap();
        assert_eq!(v.total_value, 0);
        assert_eq!(v.lines[0].average_unit_cost, None);
    }
}
