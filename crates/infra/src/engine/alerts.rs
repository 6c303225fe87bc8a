use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stockledger_core::{DomainResult, ItemId, LocationId};
use stockledger_inventory::{BatchStatus, Item};

use super::InventoryEngine;
use crate::store::InventoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    OutOfStock,
    LowStock,
    Overstock,
    BatchExpiring,
    BatchExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub kind: AlertKind,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub sku: String,
    pub on_hand: i64,
    pub available: i64,
    /// The threshold that was crossed, for level alerts.
    pub threshold: Option<i64>,
    pub lot_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub message: String,
}

fn level_alert(item: &Item, on_hand: i64, available: i64) -> Option<(AlertKind, Option<i64>)> {
    if available <= 0 {
        return Some((AlertKind::OutOfStock, None));
    }
    if item.reorder_point > 0 && on_hand <= item.reorder_point {
        return Some((AlertKind::LowStock, Some(item.reorder_point)));
    }
    if on_hand < item.min_stock {
        return Some((AlertKind::LowStock, Some(item.min_stock)));
    }
    if item.max_stock > 0 && on_hand > item.max_stock {
        return Some((AlertKind::Overstock, Some(item.max_stock)));
    }
    None
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    /// Level alerts per stock row plus expiry alerts per lot, for active
    /// items. Read-only; nothing is written.
    pub fn check_stock_alerts(&self, location_id: Option<&LocationId>) -> DomainResult<Vec<StockAlert>> {
        let items: HashMap<ItemId, Item> = self
            .store
            .list_items()?
            .into_iter()
            .filter(|item| item.active)
            .map(|item| (item.id.clone(), item))
            .collect();
        let today = self.now().date_naive();
        let warn_until = today + Duration::days(i64::from(self.config.expiry_warning_days));

        let mut alerts = Vec::new();
        let mut levels: HashMap<(ItemId, LocationId), (i64, i64)> = HashMap::new();
        for row in self.store.list_stock(location_id)? {
            let Some(item) = items.get(&row.item_id) else {
                continue;
            };
            levels.insert((row.item_id.clone(), row.location_id.clone()), (row.on_hand, row.available));
            if let Some((kind, threshold)) = level_alert(item, row.on_hand, row.available) {
                let message = match kind {
                    AlertKind::OutOfStock => format!("{} is out of stock at {}", item.sku, row.location_id),
                    AlertKind::LowStock => format!(
                        "{} is low at {}: {} on hand",
                        item.sku, row.location_id, row.on_hand
                    ),
                    _ => format!(
                        "{} is overstocked at {}: {} on hand",
                        item.sku, row.location_id, row.on_hand
                    ),
                };
                alerts.push(StockAlert {
                    kind,
                    item_id: row.item_id.clone(),
                    location_id: row.location_id.clone(),
                    sku: item.sku.clone(),
                    on_hand: row.on_hand,
                    available: row.available,
                    threshold,
                    lot_number: None,
                    expiry_date: None,
                    message,
                });
            }
        }

        for batch in self.store.all_batches()? {
            if location_id.is_some_and(|loc| *loc != batch.location_id) {
                continue;
            }
            let Some(item) = items.get(&batch.item_id) else {
                continue;
            };
            if batch.quantity_available <= 0 || batch.status == BatchStatus::Sold {
                continue;
            }
            let Some(expiry) = batch.expiry_date else {
                continue;
            };
            let kind = if batch.status == BatchStatus::Expired || batch.is_past_expiry(today) {
                AlertKind::BatchExpired
            } else if expiry <= warn_until {
                AlertKind::BatchExpiring
            } else {
                continue;
            };
            let (on_hand, available) = levels
                .get(&(batch.item_id.clone(), batch.location_id.clone()))
                .copied()
                .unwrap_or((0, 0));
            let message = match kind {
                AlertKind::BatchExpired => format!(
                    "lot {} of {} expired on {expiry}",
                    batch.lot_number, item.sku
                ),
                _ => format!(
                    "lot {} of {} expires on {expiry}",
                    batch.lot_number, item.sku
                ),
            };
            alerts.push(StockAlert {
                kind,
                item_id: batch.item_id.clone(),
                location_id: batch.location_id.clone(),
                sku: item.sku.clone(),
                on_hand,
                available,
                threshold: None,
                lot_number: Some(batch.lot_number.clone()),
                expiry_date: Some(expiry),
                message,
            });
        }

        alerts.sort_by(|a, b| {
            (&a.location_id, &a.item_id, a.kind, &a.lot_number)
                .cmp(&(&b.location_id, &b.item_id, b.kind, &b.lot_number))
        });
        debug!(alerts = alerts.len(), "stock alerts checked");
        Ok(alerts)
    }
}
