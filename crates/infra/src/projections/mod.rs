//! Read-model projections rebuilt from the movement log.

pub mod location_stock;

pub use location_stock::{replay_location_stock, LocationStockProjection, ProjectionError};
