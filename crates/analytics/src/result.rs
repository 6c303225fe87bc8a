use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::{DomainError, ItemId, LocationId};

/// Demand forecast for one item at one location.
///
/// This is an analytical result, not a ledger event. Higher layers may persist
/// or display it without touching stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandForecast {
    pub item_id: ItemId,
    pub location_id: LocationId,

    /// Model that produced the figure (`moving_average`, `seasonal`, ...).
    pub model: String,

    pub horizon_days: u32,

    /// Total expected consumption over the horizon.
    pub forecasted_demand: f64,

    /// Per-day breakdown of `forecasted_demand`.
    pub daily_forecast: Vec<f64>,

    /// Confidence in \[0, 1\] derived from history length and volatility.
    pub confidence: f64,

    /// Number of daily observations the model was fitted on.
    pub history_days: usize,

    pub explanation: Option<String>,

    /// Model parameters and fit diagnostics.
    pub metadata: JsonValue,
}

impl DemandForecast {
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalyticsError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    #[error("no forecast model available: {0}")]
    NoModelAvailable(String),

    #[error("prediction failed: {0}")]
    PredictionFailed(String),

    #[error("job interrupted: {0}")]
    Interrupted(String),
}

impl From<AnalyticsError> for DomainError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            AnalyticsError::InvalidInput(msg) => DomainError::Validation(msg),
            AnalyticsError::InsufficientHistory(msg) => DomainError::InsufficientHistory(msg),
            AnalyticsError::NoModelAvailable(msg) => DomainError::NoModelAvailable(msg),
            AnalyticsError::PredictionFailed(msg) => {
                DomainError::NoModelAvailable(format!("external predictor failed: {msg}"))
            }
            AnalyticsError::Interrupted(msg) => DomainError::Interrupted(msg),
        }
    }
}
