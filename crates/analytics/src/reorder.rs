//! Reorder suggestions and priority classification.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stockledger_core::{ItemId, LocationId};
use stockledger_inventory::ForecastModel;

use crate::forecast::{DemandHistory, DemandPredictor, ForecastJob};
use crate::job::{AnalyticsJob, JobControl};
use crate::result::{AnalyticsError, DemandForecast};

/// Urgency of a reorder, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReorderPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ReorderPriority {
    /// From `on_hand / reorder_point`.
    pub fn from_stock_ratio(ratio: f64) -> Self {
        if ratio <= 0.5 {
            ReorderPriority::Critical
        } else if ratio <= 0.8 {
            ReorderPriority::High
        } else if ratio <= 1.2 {
            ReorderPriority::Medium
        } else {
            ReorderPriority::Low
        }
    }

    /// From `on_hand / forecasted_demand`.
    pub fn from_coverage_ratio(ratio: f64) -> Self {
        if ratio <= 0.5 {
            ReorderPriority::Critical
        } else if ratio <= 1.0 {
            ReorderPriority::High
        } else if ratio <= 2.0 {
            ReorderPriority::Medium
        } else {
            ReorderPriority::Low
        }
    }
}

/// Classify by both ratios; the worse one governs.
pub fn classify(stock_ratio: f64, coverage_ratio: Option<f64>) -> ReorderPriority {
    let by_stock = ReorderPriority::from_stock_ratio(stock_ratio);
    match coverage_ratio {
        Some(coverage) => by_stock.min(ReorderPriority::from_coverage_ratio(coverage)),
        None => by_stock,
    }
}

/// An item/location at or below its reorder point, with the inputs needed to
/// forecast it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderCandidate {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub sku: String,
    pub on_hand: i64,
    pub on_order: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub lead_time_days: u32,
    pub model: ForecastModel,
    /// `None` when the item never moved at the location.
    pub history: Option<DemandHistory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderSuggestion {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub sku: String,
    pub on_hand: i64,
    pub on_order: i64,
    pub reorder_point: i64,
    pub suggested_quantity: i64,
    pub forecasted_demand: Option<f64>,
    pub forecast_model: Option<String>,
    /// Why no forecast backs this suggestion, if it failed.
    pub forecast_error: Option<String>,
    pub stock_ratio: f64,
    pub coverage_ratio: Option<f64>,
    pub priority: ReorderPriority,
}

impl ReorderSuggestion {
    /// Combine a candidate with the outcome of its forecast.
    ///
    /// A failed forecast is reported on the suggestion, never replaced by a
    /// made-up demand figure: the quantity falls back to `reorder_quantity`
    /// and priority to the stock ratio alone.
    pub fn build(candidate: &ReorderCandidate, forecast: Result<&DemandForecast, &AnalyticsError>) -> Self {
        let stock_ratio = if candidate.reorder_point > 0 {
            candidate.on_hand as f64 / candidate.reorder_point as f64
        } else {
            0.0
        };

        let (forecasted_demand, forecast_model, forecast_error) = match forecast {
            Ok(f) => (Some(f.forecasted_demand), Some(f.model.clone()), None),
            Err(e) => (None, None, Some(e.to_string())),
        };

        let coverage_ratio = forecasted_demand.map(|demand| {
            if demand > 0.0 {
                candidate.on_hand as f64 / demand
            } else {
                f64::INFINITY
            }
        });

        let forecast_units = forecasted_demand.map_or(0, |d| d.ceil() as i64);
        Self {
            item_id: candidate.item_id.clone(),
            location_id: candidate.location_id.clone(),
            sku: candidate.sku.clone(),
            on_hand: candidate.on_hand,
            on_order: candidate.on_order,
            reorder_point: candidate.reorder_point,
            suggested_quantity: candidate.reorder_quantity.max(forecast_units),
            forecasted_demand,
            forecast_model,
            forecast_error,
            stock_ratio,
            coverage_ratio,
            priority: classify(stock_ratio, coverage_ratio),
        }
    }
}

/// Forecast and prioritise every candidate.
pub struct ReorderJob {
    candidates: Vec<ReorderCandidate>,
    safety_horizon_days: u32,
    predictor: Option<Arc<dyn DemandPredictor>>,
}

impl ReorderJob {
    pub fn new(candidates: Vec<ReorderCandidate>, safety_horizon_days: u32) -> Self {
        Self {
            candidates,
            safety_horizon_days,
            predictor: None,
        }
    }

    pub fn with_predictor(mut self, predictor: Option<Arc<dyn DemandPredictor>>) -> Self {
        self.predictor = predictor;
        self
    }

    fn forecast(&self, candidate: &ReorderCandidate, control: &JobControl) -> Result<DemandForecast, AnalyticsError> {
        let history = candidate.history.clone().ok_or_else(|| {
            AnalyticsError::InsufficientHistory(format!(
                "no movements for {} at {}",
                candidate.item_id, candidate.location_id
            ))
        })?;
        ForecastJob::new(
            history,
            candidate.model,
            candidate.lead_time_days + self.safety_horizon_days,
        )
        .with_predictor(self.predictor.clone())
        .run(control)
    }
}

impl AnalyticsJob for ReorderJob {
    type Output = Vec<ReorderSuggestion>;

    fn name(&self) -> &'static str {
        "reorder_suggestions"
    }

    fn run(&self, control: &JobControl) -> Result<Self::Output, AnalyticsError> {
        let mut suggestions = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            control.checkpoint()?;
            let forecast = match self.forecast(candidate, control) {
                Err(AnalyticsError::Interrupted(msg)) => return Err(AnalyticsError::Interrupted(msg)),
                other => other,
            };
            suggestions.push(ReorderSuggestion::build(candidate, forecast.as_ref()));
        }
        suggestions.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.stock_ratio.total_cmp(&b.stock_ratio))
                .then_with(|| a.item_id.cmp(&b.item_id))
                .then_with(|| a.location_id.cmp(&b.location_id))
        });
        tracing::debug!(
            suggestions = suggestions.len(),
            critical = suggestions
                .iter()
                .filter(|s| s.priority == ReorderPriority::Critical)
                .count(),
            "reorder pass complete"
        );
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candidate(on_hand: i64, reorder_point: i64, history: Option<Vec<f64>>) -> ReorderCandidate {
        ReorderCandidate {
            item_id: ItemId::from("x"),
            location_id: LocationId::from("wh"),
            sku: "X".into(),
            on_hand,
            on_order: 0,
            reorder_point,
            reorder_quantity: 20,
            lead_time_days: 3,
            model: ForecastModel::MovingAverage { window: 7 },
            history: history.map(|daily| DemandHistory {
                item_id: ItemId::from("x"),
                location_id: LocationId::from("wh"),
                start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                daily,
            }),
        }
    }

    #[test]
    fn worse_ratio_governs() {
        assert_eq!(classify(1.0, Some(3.0)), ReorderPriority::Medium);
        assert_eq!(classify(1.0, Some(0.4)), ReorderPriority::Critical);
        assert_eq!(classify(0.7, None), ReorderPriority::High);
        assert_eq!(classify(1.5, Some(1.0)), ReorderPriority::High);
        assert_eq!(classify(1.5, Some(f64::INFINITY)), ReorderPriority::Low);
    }

    #[test]
    fn thresholds_are_inclusive() {
        assert_eq!(ReorderPriority::from_stock_ratio(0.5), ReorderPriority::Critical);
        assert_eq!(ReorderPriority::from_stock_ratio(0.8), ReorderPriority::High);
        assert_eq!(ReorderPriority::from_stock_ratio(1.2), ReorderPriority::Medium);
        assert_eq!(ReorderPriority::from_coverage_ratio(2.0), ReorderPriority::Medium);
        assert_eq!(ReorderPriority::from_coverage_ratio(2.01), ReorderPriority::Low);
    }

    #[test]
    fn suggestion_takes_larger_of_reorder_quantity_and_forecast() {
        // 10/day over 3 + 7 days = 100 units forecast.
        let job = ReorderJob::new(vec![candidate(9, 10, Some(vec![10.0; 14]))], 7);
        let out = job.run(&JobControl::new()).unwrap();
        assert_eq!(out[0].suggested_quantity, 100);
        assert_eq!(out[0].forecasted_demand, Some(100.0));
        // coverage 9/100 is critical even though stock ratio 0.9 is only medium
        assert_eq!(out[0].priority, ReorderPriority::Critical);
    }

    #[test]
    fn failed_forecast_is_reported_not_guessed() {
        let job = ReorderJob::new(vec![candidate(4, 10, None)], 7);
        let out = job.run(&JobControl::new()).unwrap();
        assert_eq!(out[0].forecasted_demand, None);
        assert!(out[0].forecast_error.as_deref().unwrap().contains("insufficient history"));
        assert_eq!(out[0].suggested_quantity, 20);
        assert_eq!(out[0].priority, ReorderPriority::Critical);
    }

    #[test]
    fn output_is_sorted_by_priority() {
        let mut low = candidate(10, 10, None);
        low.item_id = ItemId::from("a");
        let mut crit = candidate(1, 10, None);
        crit.item_id = ItemId::from("b");
        let out = ReorderJob::new(vec![low, crit], 7).run(&JobControl::new()).unwrap();
        assert_eq!(out[0].item_id, ItemId::from("b"));
    }

    #[test]
    fn cancellation_discards_everything() {
        let control = JobControl::new();
        control.cancel();
        let err = ReorderJob::new(vec![candidate(1, 10, None)], 7)
            .run(&control)
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Interrupted(_)));
    }
}
