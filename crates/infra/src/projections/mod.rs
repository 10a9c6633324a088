//! Read model projections built from published event envelopes.

pub mod stock_levels;

pub use stock_levels::{StockLevel, StockLevelsProjection};
