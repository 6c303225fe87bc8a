//! Infrastructure layer: storage, the stock ledger, projections and the
//! engine handle that runs every inventory operation.

pub mod config;
pub mod engine;
pub mod ledger;
pub mod projections;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::EngineConfig;
pub use engine::{
    AlertKind, AssemblyResult, CountSelection, DisassemblyResult, InventoryEngine, IssueStock,
    ProjectionCheck, ReceiveStock, ReturnStock, StockAlert,
};
pub use ledger::{AdjustRequest, BatchSpec, KeyLocks, LedgerTx, Posting, StockLedger};
pub use store::{ChangeSet, InMemoryStore, InventoryStore, MovementQuery, StoreError, Versioned, Write};
