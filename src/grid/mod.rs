//! Grid Reversal Trading for Bybit linear perpetuals
//!
//! A fixed ladder of price levels. When price crosses a level the bot opens a
//! position in the direction of the move, or reverses the position facing the
//! other way. After a losing close the next position is larger (cover-loss
//! sizing); winners decay the size back toward the base.
//!
//! # Architecture
//!
//! - [`table`] - Ordered price levels and their position bindings
//! - [`controller`] - Tick processing: crossings, reversals, exits, risk
//! - [`sizing`] - Cover-loss multiplier and PnL counters
//! - [`config`] - Controller configuration and validation
//! - [`types`] - Orders, positions, status snapshot
//! - [`errors`] - Grid-specific error types
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`bybit`] - Bybit v5 REST exchange
//! - [`paper`] - Simulated fills on live prices
//! - [`indicators`] - Price history and status indicators
//! - [`runner`] - Main execution loop
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bybit_grid_bot::grid::{
//!     BybitConfig, BybitCredentials, BybitExchange, GridConfig, GridController,
//!     GridRunner, RunnerConfig,
//! };
//!
//! let config = GridConfig::new("BTCUSDT", vec![44000.0, 45000.0, 46000.0], 0.01)
//!     .with_leverage(10)
//!     .with_risk_limits(100.0, 50.0);
//!
//! let exchange = Arc::new(BybitExchange::new(
//!     BybitConfig::new(true),
//!     BybitCredentials::from_env()?,
//! )?);
//!
//! let controller = GridController::new(config, exchange)?;
//! let mut runner = GridRunner::new(controller, RunnerConfig::default());
//! runner.run().await?;
//! ```
//!
//! # Testing
//!
//! ```rust,ignore
//! use bybit_grid_bot::grid::executor::mock::MockExchange;
//!
//! let exchange = Arc::new(MockExchange::new(45000.0));
//! exchange.set_fail_closes(true).await;
//! ```

pub mod bybit;
pub mod config;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod indicators;
pub mod paper;
pub mod runner;
pub mod sizing;
pub mod table;
pub mod types;

// Re-export commonly used types
pub use bybit::{BybitConfig, BybitCredentials, BybitExchange};
pub use config::GridConfig;
pub use controller::{GridController, TickOutcome};
pub use errors::{GridError, GridResult};
pub use executor::GridExchange;
pub use indicators::{IndicatorSnapshot, PriceHistory, Volatility};
pub use paper::PaperExchange;
pub use runner::{GridRunner, RunnerConfig, RunnerHandle, StatusReport};
pub use sizing::{CoverLossPolicy, PerformanceCounters};
pub use table::{GridLevel, GridTable};
pub use types::{
    CloseReason, ExchangePosition, OrderAck, OrderId, OrderRequest, OrderSide, Position,
    PositionSide, StatusSnapshot, Ticker,
};
