//! Demand forecasting over daily consumption series.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use stockledger_core::{ItemId, LocationId};
use stockledger_inventory::{ForecastModel, StockMovement};

use crate::job::{AnalyticsJob, JobControl};
use crate::result::{AnalyticsError, DemandForecast};

/// Daily consumption of one item at one location, oldest day first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandHistory {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub start: NaiveDate,
    pub daily: Vec<f64>,
}

impl DemandHistory {
    pub fn total(&self) -> f64 {
        self.daily.iter().sum()
    }
}

/// Build the consumption series for `item_id` at `location_id` ending on `end`.
///
/// The series starts at the item's first movement at the location (capped to
/// `max_days`). Only consumption kinds (issues and kit component issues) count
/// as demand. Returns `None` when the item never moved there.
pub fn daily_consumption(
    movements: &[StockMovement],
    item_id: &ItemId,
    location_id: &LocationId,
    end: NaiveDate,
    max_days: u32,
) -> Option<DemandHistory> {
    let relevant: Vec<&StockMovement> = movements
        .iter()
        .filter(|m| &m.item_id == item_id && &m.location_id == location_id)
        .filter(|m| m.occurred_at.date_naive() <= end)
        .collect();
    let first = relevant.iter().map(|m| m.occurred_at.date_naive()).min()?;

    let earliest = end - chrono::Duration::days(i64::from(max_days.max(1)) - 1);
    let start = first.max(earliest);
    let days = (end - start).num_days() as usize + 1;

    let mut daily = vec![0.0; days];
    for m in relevant.iter().filter(|m| m.kind.is_consumption()) {
        let day = m.occurred_at.date_naive();
        if day < start {
            continue;
        }
        let offset = (day - start).num_days() as usize;
        daily[offset] += (-m.quantity) as f64;
    }

    Some(DemandHistory {
        item_id: item_id.clone(),
        location_id: location_id.clone(),
        start,
        daily,
    })
}

/// Prediction interface for externally hosted models.
pub trait DemandPredictor: Send + Sync {
    fn name(&self) -> &str;

    /// Total expected consumption over `horizon_days`.
    fn predict(&self, history: &DemandHistory, horizon_days: u32) -> Result<f64, AnalyticsError>;
}

/// Forecast demand for one item/location over a horizon.
#[derive(Clone)]
pub struct ForecastJob {
    history: DemandHistory,
    model: ForecastModel,
    horizon_days: u32,
    predictor: Option<Arc<dyn DemandPredictor>>,
}

impl core::fmt::Debug for ForecastJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForecastJob")
            .field("item_id", &self.history.item_id)
            .field("location_id", &self.history.location_id)
            .field("model", &self.model)
            .field("horizon_days", &self.horizon_days)
            .field("predictor", &self.predictor.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl ForecastJob {
    pub fn new(history: DemandHistory, model: ForecastModel, horizon_days: u32) -> Self {
        Self {
            history,
            model,
            horizon_days,
            predictor: None,
        }
    }

    pub fn with_predictor(mut self, predictor: Option<Arc<dyn DemandPredictor>>) -> Self {
        self.predictor = predictor;
        self
    }

    fn fit(&self, control: &JobControl) -> Result<Vec<f64>, AnalyticsError> {
        let xs = &self.history.daily;
        let h = self.horizon_days as usize;
        match self.model {
            ForecastModel::MovingAverage { window } => {
                let take = window.min(xs.len());
                let rate = mean(&xs[xs.len() - take..]);
                Ok(vec![rate; h])
            }
            ForecastModel::ExponentialSmoothing { alpha } => {
                let mut level = xs[0];
                for (i, x) in xs.iter().enumerate().skip(1) {
                    if i % 256 == 0 {
                        control.checkpoint()?;
                    }
                    level = alpha * x + (1.0 - alpha) * level;
                }
                Ok(vec![level; h])
            }
            ForecastModel::LinearRegression => {
                if xs.len() < 2 {
                    return Err(AnalyticsError::InsufficientHistory(format!(
                        "linear regression needs at least 2 days of history, have {}",
                        xs.len()
                    )));
                }
                let points: Vec<(f64, f64)> =
                    xs.iter().enumerate().map(|(t, y)| (t as f64, *y)).collect();
                let (a, b) = linear_fit(&points);
                let n = xs.len();
                Ok((0..h)
                    .map(|k| (a + b * (n + k) as f64).max(0.0))
                    .collect())
            }
            ForecastModel::Seasonal { period } => seasonal_forecast(xs, period, h),
            ForecastModel::External => {
                let predictor = self.predictor.as_ref().ok_or_else(|| {
                    AnalyticsError::NoModelAvailable(
                        "external forecast model requested but no predictor is configured".to_string(),
                    )
                })?;
                let total = predictor.predict(&self.history, self.horizon_days)?;
                if !total.is_finite() || total < 0.0 {
                    return Err(AnalyticsError::PredictionFailed(format!(
                        "predictor {} returned {total}",
                        predictor.name()
                    )));
                }
                Ok(vec![total / h as f64; h])
            }
        }
    }
}

impl AnalyticsJob for ForecastJob {
    type Output = DemandForecast;

    fn name(&self) -> &'static str {
        "demand_forecast"
    }

    fn run(&self, control: &JobControl) -> Result<DemandForecast, AnalyticsError> {
        self.model
            .validate()
            .map_err(|e| AnalyticsError::InvalidInput(e.to_string()))?;
        if self.horizon_days == 0 {
            return Err(AnalyticsError::InvalidInput(
                "forecast horizon must be at least one day".to_string(),
            ));
        }
        if self.history.daily.is_empty() || self.history.total() <= 0.0 {
            return Err(AnalyticsError::InsufficientHistory(format!(
                "no consumption recorded for {} at {}",
                self.history.item_id, self.history.location_id
            )));
        }
        control.checkpoint()?;

        let daily = self.fit(control)?;
        control.checkpoint()?;

        let forecasted: f64 = daily.iter().sum();
        let confidence = confidence(&self.history.daily);
        let model = self.model.name();

        Ok(DemandForecast {
            item_id: self.history.item_id.clone(),
            location_id: self.history.location_id.clone(),
            model: self
                .predictor
                .as_ref()
                .filter(|_| self.model == ForecastModel::External)
                .map_or_else(|| model.to_string(), |p| format!("external:{}", p.name())),
            horizon_days: self.horizon_days,
            forecasted_demand: forecasted,
            daily_forecast: daily,
            confidence,
            history_days: self.history.daily.len(),
            explanation: None,
            metadata: serde_json::Value::Null,
        }
        .with_explanation(format!(
            "{model} forecast of {forecasted:.2} units over {} days from {} days of history",
            self.horizon_days,
            self.history.daily.len()
        ))
        .with_metadata(json!({
            "kind": "inventory.demand_forecast",
            "model": self.model,
            "history_start": self.history.start,
            "history_total": self.history.total(),
            "mean_daily": mean(&self.history.daily),
        })))
    }
}

fn seasonal_forecast(xs: &[f64], period: usize, horizon: usize) -> Result<Vec<f64>, AnalyticsError> {
    if xs.len() < 2 * period {
        return Err(AnalyticsError::InsufficientHistory(format!(
            "seasonal model with period {period} needs {} days of history, have {}",
            2 * period,
            xs.len()
        )));
    }
    let overall = mean(xs);
    let indices: Vec<f64> = (0..period)
        .map(|phase| {
            let phase_values: Vec<f64> = xs.iter().skip(phase).step_by(period).copied().collect();
            if overall > 0.0 {
                mean(&phase_values) / overall
            } else {
                0.0
            }
        })
        .collect();

    // Trend on the deseasonalized series; phases with a zero index carry no signal.
    let points: Vec<(f64, f64)> = xs
        .iter()
        .enumerate()
        .filter(|(t, _)| indices[t % period] > 0.0)
        .map(|(t, y)| (t as f64, y / indices[t % period]))
        .collect();
    let (a, b) = linear_fit(&points);

    let n = xs.len();
    Ok((0..horizon)
        .map(|k| {
            let t = n + k;
            (a + b * t as f64).max(0.0) * indices[t % period]
        })
        .collect())
}

/// Ordinary least squares; returns `(intercept, slope)`.
fn linear_fit(points: &[(f64, f64)]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let var_x: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if var_x <= f64::EPSILON {
        return (mean_y, 0.0);
    }
    let cov: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let slope = cov / var_x;
    (mean_y - slope * mean_x, slope)
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / (xs.len() as f64)
}

/// More history and lower volatility give higher confidence.
fn confidence(xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let m = mean(xs);
    if m <= 0.0 {
        return 0.0;
    }
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n;
    let cv = var.sqrt() / m;
    ((n / (n + 14.0)) / (1.0 + cv)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use stockledger_core::{ActorId, MovementId};
    use stockledger_inventory::{MovementDraft, MovementKind, Reference};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap() + Duration::days(n)
    }

    fn movement(kind: MovementKind, qty: i64, at: DateTime<Utc>) -> StockMovement {
        MovementDraft::new(
            ItemId::from("x"),
            LocationId::from("wh"),
            kind,
            qty,
            Reference::manual("t"),
        )
        .into_movement(MovementId::generate(), ActorId::from("t"), at)
        .unwrap()
    }

    fn history(daily: Vec<f64>) -> DemandHistory {
        DemandHistory {
            item_id: ItemId::from("x"),
            location_id: LocationId::from("wh"),
            start: day(0).date_naive(),
            daily,
        }
    }

    fn run(job: ForecastJob) -> Result<DemandForecast, AnalyticsError> {
        job.run(&JobControl::new())
    }

    #[test]
    fn consumption_series_starts_at_first_movement() {
        let movements = vec![
            movement(MovementKind::Receipt { unit_cost: 1 }, 100, day(0)),
            movement(MovementKind::Issue, -4, day(1)),
            movement(MovementKind::Issue, -6, day(3)),
            movement(MovementKind::Return, 2, day(3)),
        ];
        let h = daily_consumption(
            &movements,
            &ItemId::from("x"),
            &LocationId::from("wh"),
            day(4).date_naive(),
            90,
        )
        .unwrap();
        assert_eq!(h.daily, vec![0.0, 4.0, 0.0, 6.0, 0.0]);
        assert!(
            daily_consumption(&movements, &ItemId::from("y"), &LocationId::from("wh"), day(4).date_naive(), 90)
                .is_none()
        );
    }

    #[test]
    fn consumption_series_is_capped() {
        let movements = vec![
            movement(MovementKind::Issue, -1, day(0)),
            movement(MovementKind::Issue, -1, day(9)),
        ];
        let h = daily_consumption(
            &movements,
            &ItemId::from("x"),
            &LocationId::from("wh"),
            day(9).date_naive(),
            5,
        )
        .unwrap();
        assert_eq!(h.daily.len(), 5);
        assert_eq!(h.total(), 1.0);
    }

    #[test]
    fn moving_average_uses_trailing_window() {
        let f = run(ForecastJob::new(
            history(vec![100.0, 1.0, 2.0, 3.0]),
            ForecastModel::MovingAverage { window: 3 },
            5,
        ))
        .unwrap();
        assert!((f.forecasted_demand - 10.0).abs() < 1e-9);
        assert_eq!(f.daily_forecast.len(), 5);
        assert_eq!(f.model, "moving_average");
    }

    #[test]
    fn exponential_smoothing_tracks_level() {
        let f = run(ForecastJob::new(
            history(vec![10.0, 20.0]),
            ForecastModel::ExponentialSmoothing { alpha: 0.5 },
            2,
        ))
        .unwrap();
        assert!((f.forecasted_demand - 30.0).abs() < 1e-9);
    }

    #[test]
    fn linear_regression_extrapolates_trend_and_clamps() {
        let up = run(ForecastJob::new(
            history(vec![1.0, 2.0, 3.0, 4.0]),
            ForecastModel::LinearRegression,
            2,
        ))
        .unwrap();
        assert!((up.daily_forecast[0] - 5.0).abs() < 1e-9);
        assert!((up.daily_forecast[1] - 6.0).abs() < 1e-9);

        let down = run(ForecastJob::new(
            history(vec![4.0, 3.0, 2.0, 1.0]),
            ForecastModel::LinearRegression,
            3,
        ))
        .unwrap();
        assert!(down.daily_forecast.iter().all(|d| *d >= 0.0));
        assert_eq!(down.daily_forecast[2], 0.0);
    }

    #[test]
    fn seasonal_model_repeats_weekly_shape() {
        let week = [0.0, 10.0, 10.0, 10.0, 10.0, 10.0, 20.0];
        let daily: Vec<f64> = week.iter().chain(week.iter()).copied().collect();
        let f = run(ForecastJob::new(history(daily), ForecastModel::Seasonal { period: 7 }, 7)).unwrap();
        assert!(f.daily_forecast[0].abs() < 1e-9);
        assert!((f.daily_forecast[1] - 10.0).abs() < 1e-6);
        assert!((f.daily_forecast[6] - 20.0).abs() < 1e-6);
    }

    #[test]
    fn seasonal_model_needs_two_periods() {
        let err = run(ForecastJob::new(
            history(vec![1.0; 10]),
            ForecastModel::Seasonal { period: 7 },
            7,
        ))
        .unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientHistory(_)));
    }

    #[test]
    fn no_consumption_is_insufficient_history() {
        let err = run(ForecastJob::new(
            history(vec![0.0; 30]),
            ForecastModel::MovingAverage { window: 7 },
            7,
        ))
        .unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientHistory(_)));
    }

    #[test]
    fn external_model_without_predictor_is_unavailable() {
        let err = run(ForecastJob::new(history(vec![1.0; 5]), ForecastModel::External, 7)).unwrap_err();
        assert!(matches!(err, AnalyticsError::NoModelAvailable(_)));
    }

    struct Fixed(f64);

    impl DemandPredictor for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn predict(&self, _: &DemandHistory, _: u32) -> Result<f64, AnalyticsError> {
            Ok(self.0)
        }
    }

    #[test]
    fn external_predictor_is_consumed() {
        let f = run(
            ForecastJob::new(history(vec![1.0; 5]), ForecastModel::External, 4)
                .with_predictor(Some(Arc::new(Fixed(42.0)))),
        )
        .unwrap();
        assert_eq!(f.forecasted_demand, 42.0);
        assert_eq!(f.model, "external:fixed");

        let err = run(
            ForecastJob::new(history(vec![1.0; 5]), ForecastModel::External, 4)
                .with_predictor(Some(Arc::new(Fixed(f64::NAN)))),
        )
        .unwrap_err();
        assert!(matches!(err, AnalyticsError::PredictionFailed(_)));
    }

    #[test]
    fn confidence_grows_with_stable_history() {
        let short = confidence(&[5.0, 5.0]);
        let long = confidence(&[5.0; 60]);
        let noisy = confidence(&[0.0, 10.0, 0.0, 10.0, 0.0, 10.0]);
        assert!(long > short);
        assert!(long > noisy);
        assert!((0.0..=1.0).contains(&long));
    }
}
