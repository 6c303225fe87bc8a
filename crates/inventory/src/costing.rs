//! Cost layers and issue pricing (FIFO, LIFO, weighted average, specific cost).
//!
//! Every priced inbound movement pushes a layer; every outbound movement that
//! leaves the location consumes layers according to the item's costing method.
//! Amounts are integer minor currency units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchAllocation;
use crate::stock::StockKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostingMethod {
    #[default]
    Fifo,
    Lifo,
    WeightedAverage,
    /// Priced by the issued lot, FIFO for anything not matched to a lot.
    SpecificCost,
}

impl core::str::FromStr for CostingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(CostingMethod::Fifo),
            "lifo" => Ok(CostingMethod::Lifo),
            "weighted_average" | "average" => Ok(CostingMethod::WeightedAverage),
            "specific_cost" | "specific" => Ok(CostingMethod::SpecificCost),
            other => Err(format!("unknown costing method '{other}'")),
        }
    }
}

/// A priced lot of received inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLayer {
    pub seq: u64,
    pub lot_number: Option<String>,
    pub quantity: i64,
    pub original_quantity: i64,
    pub unit_cost: i64,
    pub received_at: DateTime<Utc>,
}

impl CostLayer {
    pub fn value(&self) -> i64 {
        self.quantity * self.unit_cost
    }
}

/// Quantity taken from one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDraw {
    pub layer_seq: Option<u64>,
    pub lot_number: Option<String>,
    pub quantity: i64,
    pub unit_cost: i64,
}

/// Result of pricing an outbound quantity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostDraw {
    pub quantity: i64,
    pub total_cost: i64,
    pub draws: Vec<LayerDraw>,
}

impl CostDraw {
    /// Blended unit cost of the draw, rounded to the nearest minor unit.
    pub fn unit_cost(&self) -> i64 {
        if self.quantity == 0 {
            0
        } else {
            div_round(self.total_cost as i128, self.quantity as i128)
        }
    }
}

/// Round-half-away-from-zero integer division.
pub fn div_round(numerator: i128, denominator: i128) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let q = numerator / denominator;
    let r = numerator % denominator;
    let adjust = if 2 * r.abs() >= denominator.abs() {
        if (numerator < 0) ^ (denominator < 0) { -1 } else { 1 }
    } else {
        0
    };
    (q + adjust) as i64
}

/// All open cost layers of one item at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLayers {
    pub key: StockKey,
    pub layers: Vec<CostLayer>,
    next_seq: u64,
}

impl CostLayers {
    pub fn new(key: StockKey) -> Self {
        Self {
            key,
            layers: Vec::new(),
            next_seq: 1,
        }
    }

    pub fn quantity(&self) -> i64 {
        self.layers.iter().map(|l| l.quantity).sum()
    }

    pub fn value(&self) -> i64 {
        self.layers.iter().map(CostLayer::value).sum()
    }

    pub fn average_cost(&self) -> Option<i64> {
        let qty = self.quantity();
        (qty > 0).then(|| div_round(self.value() as i128, qty as i128))
    }

    pub fn push(
        &mut self,
        lot_number: Option<String>,
        quantity: i64,
        unit_cost: i64,
        received_at: DateTime<Utc>,
    ) {
        if quantity <= 0 {
            return;
        }
        self.layers.push(CostLayer {
            seq: self.next_seq,
            lot_number,
            quantity,
            original_quantity: quantity,
            unit_cost,
            received_at,
        });
        self.next_seq += 1;
    }

    /// Price `quantity` units without consuming anything.
    pub fn preview(
        &self,
        method: CostingMethod,
        quantity: i64,
        lots: &[BatchAllocation],
        fallback_unit_cost: i64,
    ) -> CostDraw {
        self.clone()
            .consume(method, quantity, lots, fallback_unit_cost)
    }

    /// Consume `quantity` units. Quantity not covered by any layer is priced at
    /// `fallback_unit_cost`.
    pub fn consume(
        &mut self,
        method: CostingMethod,
        quantity: i64,
        lots: &[BatchAllocation],
        fallback_unit_cost: i64,
    ) -> CostDraw {
        let mut draw = CostDraw {
            quantity,
            ..CostDraw::default()
        };
        if quantity <= 0 {
            return draw;
        }

        let covered = match method {
            CostingMethod::Fifo => self.take_ordered(quantity, false, None, &mut draw),
            CostingMethod::Lifo => self.take_ordered(quantity, true, None, &mut draw),
            CostingMethod::WeightedAverage => self.take_average(quantity, &mut draw),
            CostingMethod::SpecificCost => {
                let mut taken = 0;
                for lot in lots {
                    let want = lot.quantity.min(quantity - taken);
                    if want <= 0 {
                        break;
                    }
                    taken += self.take_ordered(want, false, Some(&lot.lot_number), &mut draw);
                }
                if taken < quantity {
                    taken += self.take_ordered(quantity - taken, false, None, &mut draw);
                }
                taken
            }
        };

        let uncovered = quantity - covered;
        if uncovered > 0 {
            draw.total_cost += uncovered * fallback_unit_cost;
            draw.draws.push(LayerDraw {
                layer_seq: None,
                lot_number: None,
                quantity: uncovered,
                unit_cost: fallback_unit_cost,
            });
        }
        self.layers.retain(|l| l.quantity > 0);
        draw
    }

    fn take_ordered(
        &mut self,
        quantity: i64,
        newest_first: bool,
        lot: Option<&str>,
        draw: &mut CostDraw,
    ) -> i64 {
        let mut order: Vec<usize> = (0..self.layers.len())
            .filter(|&i| self.layers[i].quantity > 0)
            .filter(|&i| lot.is_none_or(|lot| self.layers[i].lot_number.as_deref() == Some(lot)))
            .collect();
        order.sort_by_key(|&i| (self.layers[i].received_at, self.layers[i].seq));
        if newest_first {
            order.reverse();
        }

        let mut remaining = quantity;
        for i in order {
            if remaining == 0 {
                break;
            }
            let layer = &mut self.layers[i];
            let take = remaining.min(layer.quantity);
            layer.quantity -= take;
            remaining -= take;
            draw.total_cost += take * layer.unit_cost;
            draw.draws.push(LayerDraw {
                layer_seq: Some(layer.seq),
                lot_number: layer.lot_number.clone(),
                quantity: take,
                unit_cost: layer.unit_cost,
            });
        }
        quantity - remaining
    }

    /// Price at the blended average, then collapse what is left into one layer.
    fn take_average(&mut self, quantity: i64, draw: &mut CostDraw) -> i64 {
        let on_hand = self.quantity();
        if on_hand <= 0 {
            return 0;
        }
        let take = quantity.min(on_hand);
        let value = self.value();
        let cost = div_round(value as i128 * take as i128, on_hand as i128);
        draw.total_cost += cost;
        draw.draws.push(LayerDraw {
            layer_seq: None,
            lot_number: None,
            quantity: take,
            unit_cost: div_round(cost as i128, take as i128),
        });

        let left = on_hand - take;
        let received_at = self.layers.iter().map(|l| l.received_at).min();
        self.layers.clear();
        if let Some(received_at) = received_at.filter(|_| left > 0) {
            let unit_cost = div_round((value - cost) as i128, left as i128);
            self.push(None, left, unit_cost, received_at);
        }
        take
    }
}
