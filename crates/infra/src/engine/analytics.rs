//! Read-side analytics. Every call snapshots what it needs from the store,
//! then runs the job through the scheduler with the caller's `JobControl`.

use std::collections::{BTreeMap, HashMap};

use chrono::Duration;
use tracing::{debug, info};

use stockledger_analytics::{
    daily_consumption, AbcAnalysis, AbcInput, AbcJob, DemandForecast, ForecastJob,
    InventoryValuation, JobControl, JobScheduler, ReorderCandidate, ReorderJob, ReorderSuggestion,
    ValuationInput, ValuationJob,
};
use stockledger_core::{DomainError, DomainResult, ItemId, LocationId};
use stockledger_inventory::{CostLayers, ForecastModel, Item, StockKey};

use super::InventoryEngine;
use crate::store::{InventoryStore, MovementQuery};

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    fn items_by_id(&self) -> DomainResult<HashMap<ItemId, Item>> {
        Ok(self
            .store
            .list_items()?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect())
    }

    /// Model precedence: explicit argument, then the item's own, then the
    /// configured default.
    pub fn generate_demand_forecast(
        &self,
        item_id: &ItemId,
        location_id: &LocationId,
        horizon_days: u32,
        model: Option<ForecastModel>,
        control: &JobControl,
    ) -> DomainResult<DemandForecast> {
        if horizon_days == 0 {
            return Err(DomainError::validation("forecast horizon must be at least one day"));
        }
        let item = self.require_item(item_id)?.value;
        let model = model
            .or(item.forecast_model)
            .unwrap_or(self.config.default_forecast_model);
        model.validate()?;

        let key = StockKey::new(item_id.clone(), location_id.clone());
        let movements = self.store.movements(&MovementQuery::for_key(&key))?;
        let history = daily_consumption(
            &movements,
            item_id,
            location_id,
            self.now().date_naive(),
            self.config.forecast_history_days,
        )
        .ok_or_else(|| {
            DomainError::InsufficientHistory(format!("no movements for {item_id} at {location_id}"))
        })?;

        let job = ForecastJob::new(history, model, horizon_days).with_predictor(self.predictor.clone());
        let forecast = self.scheduler.run(&job, control)?;
        debug!(
            %item_id,
            %location_id,
            model = model.name(),
            horizon_days,
            forecasted_demand = forecast.forecasted_demand,
            "demand forecast generated"
        );
        Ok(forecast)
    }

    /// Suggestions for every active item at or below its reorder point.
    pub fn generate_reorder_suggestions(
        &self,
        location_id: Option<&LocationId>,
        control: &JobControl,
    ) -> DomainResult<Vec<ReorderSuggestion>> {
        let items = self.items_by_id()?;
        let today = self.now().date_naive();

        let mut candidates = Vec::new();
        for row in self.store.list_stock(location_id)? {
            let Some(item) = items.get(&row.item_id) else {
                continue;
            };
            if !item.active || item.reorder_point <= 0 || row.on_hand > item.reorder_point {
                continue;
            }
            let key = row.key();
            let movements = self.store.movements(&MovementQuery::for_key(&key))?;
            candidates.push(ReorderCandidate {
                item_id: item.id.clone(),
                location_id: row.location_id.clone(),
                sku: item.sku.clone(),
                on_hand: row.on_hand,
                on_order: row.on_order,
                reorder_point: item.reorder_point,
                reorder_quantity: item.reorder_quantity,
                lead_time_days: item.lead_time_days,
                model: item.forecast_model.unwrap_or(self.config.default_forecast_model),
                history: daily_consumption(
                    &movements,
                    &item.id,
                    &row.location_id,
                    today,
                    self.config.forecast_history_days,
                ),
            });
        }

        let job = ReorderJob::new(candidates, self.config.safety_horizon_days)
            .with_predictor(self.predictor.clone());
        let suggestions = self.scheduler.run(&job, control)?;
        info!(suggestions = suggestions.len(), "reorder suggestions generated");
        Ok(suggestions)
    }

    pub fn get_inventory_valuation(
        &self,
        location_id: Option<&LocationId>,
        control: &JobControl,
    ) -> DomainResult<InventoryValuation> {
        let items = self.items_by_id()?;
        let mut layers: BTreeMap<StockKey, CostLayers> = self
            .store
            .list_cost_layers()?
            .into_iter()
            .map(|l| (l.key.clone(), l))
            .collect();

        let mut inputs = Vec::new();
        for row in self.store.list_stock(location_id)? {
            let Some(item) = items.get(&row.item_id) else {
                continue;
            };
            let key = row.key();
            let key_layers = layers.remove(&key).unwrap_or_else(|| CostLayers::new(key.clone()));
            if row.on_hand == 0 && key_layers.quantity() == 0 {
                continue;
            }
            inputs.push(ValuationInput {
                item_id: item.id.clone(),
                sku: item.sku.clone(),
                location_id: row.location_id.clone(),
                costing_method: item.costing_method,
                on_hand: row.on_hand,
                layers: key_layers,
            });
        }

        let valuation = self
            .scheduler
            .run(&ValuationJob::new(inputs, self.now()), control)?;
        info!(
            lines = valuation.lines.len(),
            total_quantity = valuation.total_quantity,
            total_value = valuation.total_value,
            "inventory valued"
        );
        Ok(valuation)
    }

    /// Classify active items by consumption value over the configured window.
    pub fn perform_abc_analysis(&self, control: &JobControl) -> DomainResult<AbcAnalysis> {
        let window_days = self.config.abc_window_days;
        let since = self.now() - Duration::days(i64::from(window_days));

        let items: HashMap<ItemId, Item> = self
            .store
            .list_items()?
            .into_iter()
            .filter(|item| item.active)
            .map(|item| (item.id.clone(), item))
            .collect();

        // (quantity, drawn cost) per item
        let mut consumed: HashMap<ItemId, (i64, i64)> = HashMap::new();
        for movement in self
            .store
            .movements(&MovementQuery::all().between(Some(since), None))?
            .into_iter()
            .filter(|m| m.kind.is_consumption())
        {
            let Some(item) = items.get(&movement.item_id) else {
                continue;
            };
            let units = movement.quantity.abs();
            let value = movement.drawn_cost.unwrap_or(units * item.cost_price);
            let entry = consumed.entry(movement.item_id).or_insert((0, 0));
            entry.0 += units;
            entry.1 += value;
        }

        let mut inputs: Vec<AbcInput> = items
            .into_values()
            .map(|item| {
                let (consumption_quantity, consumption_value) =
                    consumed.get(&item.id).copied().unwrap_or((0, 0));
                AbcInput {
                    consumption_quantity,
                    consumption_value,
                    item_id: item.id,
                    sku: item.sku,
                }
            })
            .collect();
        inputs.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        let analysis = self
            .scheduler
            .run(&AbcJob::new(inputs, self.config.abc_thresholds, window_days), control)?;
        info!(
            items = analysis.entries.len(),
            total_value = analysis.total_value,
            window_days,
            "abc analysis performed"
        );
        Ok(analysis)
    }
}
