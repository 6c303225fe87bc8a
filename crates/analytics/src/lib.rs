//! `stockledger-analytics`
//!
//! **Responsibility:** read-side analytical passes over the stock ledger.
//!
//! - Jobs consume snapshots handed to them by the caller (movement history,
//!   stock levels, cost layers); this crate never touches storage.
//! - Jobs never mutate ledger state. An interrupted job discards its partial
//!   output.
//! - Missing inputs surface as `InsufficientHistory` / `NoModelAvailable`,
//!   never as a silently substituted default.

pub mod abc;
pub mod forecast;
pub mod job;
pub mod reorder;
pub mod result;
pub mod scheduler;
pub mod valuation;

pub use abc::{AbcAnalysis, AbcClass, AbcEntry, AbcInput, AbcJob, AbcThresholds, CountFrequency};
pub use forecast::{daily_consumption, DemandHistory, DemandPredictor, ForecastJob};
pub use job::{AnalyticsJob, JobControl};
pub use reorder::{ReorderCandidate, ReorderJob, ReorderPriority, ReorderSuggestion};
pub use result::{AnalyticsError, DemandForecast};
pub use scheduler::{JobScheduler, LocalScheduler};
pub use valuation::{InventoryValuation, ValuationInput, ValuationJob, ValuationLine};
