//! Inventory engine: the explicit handle every operation goes through.
//!
//! ## Execution model
//!
//! ```text
//! operation
//!   ↓
//! 1. Read items / aggregates from the store
//!   ↓
//! 2. Open a ledger transaction over every (item, location) key involved
//!   ↓
//! 3. Decide: aggregate commands and `LedgerTx::adjust` calls (staged)
//!   ↓
//! 4. Commit one change set (movements, rows, aggregates, audit events)
//! ```
//!
//! Any error before step 4 drops the transaction and nothing is written. A
//! stale row at step 4 surfaces as a retry-safe `ConcurrencyConflict`; the
//! engine never retries on its own.
//!
//! The engine carries no global state: store, clock, configuration and the
//! optional external demand predictor are all owned by the handle.

mod alerts;
mod analytics;
mod catalog;
mod counts;
mod kits;
mod stock;
mod transfers;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use stockledger_analytics::{DemandPredictor, LocalScheduler};
use stockledger_core::{Clock, DomainError, DomainResult, ItemId, SystemClock};
use stockledger_inventory::Item;

use crate::config::EngineConfig;
use crate::ledger::StockLedger;
use crate::store::{InMemoryStore, InventoryStore, Versioned};

pub use alerts::{AlertKind, StockAlert};
pub use counts::{CountSelection, COUNT_STREAM_TYPE};
pub use kits::{AssemblyResult, DisassemblyResult};
pub use stock::{IssueStock, ProjectionCheck, ReceiveStock, ReturnStock};
pub use transfers::TRANSFER_STREAM_TYPE;

pub struct InventoryEngine<S> {
    store: Arc<S>,
    ledger: StockLedger<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    predictor: Option<Arc<dyn DemandPredictor>>,
    scheduler: LocalScheduler,
}

impl<S> Clone for InventoryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            predictor: self.predictor.clone(),
            scheduler: self.scheduler,
        }
    }
}

impl InventoryEngine<InMemoryStore> {
    /// Engine over a fresh in-memory store and the wall clock.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            config,
        )
    }
}

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let ledger = StockLedger::new(Arc::clone(&store), Arc::clone(&clock), config.batch_policy);
        let scheduler = match config.analytics_timeout {
            Some(timeout) => LocalScheduler::with_timeout(timeout),
            None => LocalScheduler::new(),
        };
        Self {
            store,
            ledger,
            clock,
            config,
            predictor: None,
            scheduler,
        }
    }

    /// Plug in an externally hosted demand model.
    pub fn with_predictor(mut self, predictor: Arc<dyn DemandPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &StockLedger<S> {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn require_item(&self, item_id: &ItemId) -> DomainResult<Versioned<Item>> {
        self.store
            .get_item(item_id)?
            .ok_or_else(|| DomainError::not_found("item", item_id))
    }
}

/// Human-facing document number, e.g. `TO-20250301-7F3A`.
fn document_number(prefix: &str, at: DateTime<Utc>, id: &str) -> String {
    let tail: String = id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{prefix}-{}-{}", at.format("%Y%m%d"), tail.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_numbers_use_date_and_id_tail() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            document_number("TO", at, "0190f1c2-7a3b-7c4d-9e5f-1234abcd7f3a"),
            "TO-20250301-7F3A"
        );
        assert_eq!(document_number("CC", at, "c1"), "CC-20250301-C1");
    }
}
