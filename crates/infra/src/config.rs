//! Engine configuration.
//!
//! Every knob has a default; `from_env` overrides them from `STOCKLEDGER_*`
//! variables. Unparseable values are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use stockledger_analytics::AbcThresholds;
use stockledger_inventory::{BatchPolicy, CostingMethod, ForecastModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lot selection when an issue does not pin a batch.
    pub batch_policy: BatchPolicy,
    /// Costing method for items created without one.
    pub default_costing: CostingMethod,
    /// Model used when neither the caller nor the item picks one.
    pub default_forecast_model: ForecastModel,
    /// Days of consumption history fed to the forecaster.
    pub forecast_history_days: u32,
    /// Days added to an item's lead time to get the reorder forecast horizon.
    pub safety_horizon_days: u32,
    pub abc_thresholds: AbcThresholds,
    /// Trailing window for ABC consumption value.
    pub abc_window_days: u32,
    /// Batches expiring within this many days raise an alert.
    pub expiry_warning_days: u32,
    /// Percent; used when a count is created without its own threshold.
    pub default_variance_threshold: f64,
    /// Upper bound on any single analytics job.
    #[serde(with = "duration_ms")]
    pub analytics_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_policy: BatchPolicy::Fifo,
            default_costing: CostingMethod::Fifo,
            default_forecast_model: ForecastModel::MovingAverage { window: 7 },
            forecast_history_days: 90,
            safety_horizon_days: 7,
            abc_thresholds: AbcThresholds::default(),
            abc_window_days: 365,
            expiry_warning_days: 30,
            default_variance_threshold: 5.0,
            analytics_timeout: None,
        }
    }
}

fn env_override<T>(name: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(err) => warn!(variable = name, value = %raw, error = %err, "ignoring invalid config value"),
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("STOCKLEDGER_BATCH_POLICY", &mut config.batch_policy);
        env_override("STOCKLEDGER_DEFAULT_COSTING", &mut config.default_costing);
        env_override("STOCKLEDGER_FORECAST_MODEL", &mut config.default_forecast_model);
        env_override("STOCKLEDGER_FORECAST_HISTORY_DAYS", &mut config.forecast_history_days);
        env_override("STOCKLEDGER_SAFETY_HORIZON_DAYS", &mut config.safety_horizon_days);
        env_override("STOCKLEDGER_ABC_A_PCT", &mut config.abc_thresholds.a);
        env_override("STOCKLEDGER_ABC_B_PCT", &mut config.abc_thresholds.b);
        env_override("STOCKLEDGER_ABC_WINDOW_DAYS", &mut config.abc_window_days);
        env_override("STOCKLEDGER_EXPIRY_WARNING_DAYS", &mut config.expiry_warning_days);
        env_override(
            "STOCKLEDGER_VARIANCE_THRESHOLD",
            &mut config.default_variance_threshold,
        );

        let mut timeout_ms: u64 = 0;
        env_override("STOCKLEDGER_ANALYTICS_TIMEOUT_MS", &mut timeout_ms);
        if timeout_ms > 0 {
            config.analytics_timeout = Some(Duration::from_millis(timeout_ms));
        }

        if let Err(err) = config.abc_thresholds.validate() {
            warn!(error = %err, "ABC thresholds out of range; using defaults");
            config.abc_thresholds = AbcThresholds::default();
        }
        config
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    pub fn with_analytics_timeout(mut self, timeout: Duration) -> Self {
        self.analytics_timeout = Some(timeout);
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
