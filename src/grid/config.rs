//! Grid controller configuration

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::sizing::CoverLossPolicy;
use super::table::GridTable;

/// Grid controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Symbol to trade (e.g., "BTCUSDT")
    pub symbol: String,

    /// Leverage applied on the exchange at startup
    pub leverage: u32,

    /// Order size before the cover-loss multiplier is applied
    pub base_position_size: f64,

    /// Exchange quantity increment; every order size is a multiple of it
    #[serde(default = "default_qty_step")]
    pub qty_step: f64,

    /// Maximum number of simultaneously open positions
    pub max_positions: usize,

    /// Grid price levels (sorted and deduplicated when the table is built)
    pub levels: Vec<f64>,

    /// Stop-loss distance as a fraction of the entry price (0.05 = 5%)
    pub stop_loss_pct: f64,

    /// Take-profit distance as a multiple of the grid step
    pub take_profit_step_multiplier: f64,

    /// Cover-loss sizing parameters
    pub cover_loss: CoverLossPolicy,

    /// Daily loss that trips the risk check
    pub max_daily_loss: f64,

    /// Per-position unrealized loss that trips the risk check
    pub max_position_loss: f64,

    /// Absolute distance from a level that counts as a crossing
    #[serde(default = "default_crossing_epsilon")]
    pub crossing_epsilon: f64,

    /// Minimum time between two crossings of the same level
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,

    /// Distance within which an adopted exchange position is bound to a level
    #[serde(default = "default_position_match_tolerance")]
    pub position_match_tolerance: f64,

    /// Upper bound on a single order round trip (milliseconds)
    #[serde(default = "default_order_timeout")]
    pub order_timeout_ms: u64,
}

fn default_qty_step() -> f64 {
    0.001
}

fn default_crossing_epsilon() -> f64 {
    0.1
}

fn default_cooldown_secs() -> f64 {
    1.0
}

fn default_position_match_tolerance() -> f64 {
    1.0
}

fn default_order_timeout() -> u64 {
    5_000
}

impl GridConfig {
    /// Create a configuration with default risk and sizing parameters
    ///
    /// # Arguments
    /// * `symbol` - Symbol to trade (e.g., "BTCUSDT")
    /// * `levels` - Grid price levels
    /// * `base_position_size` - Order size at multiplier 1.0
    pub fn new(symbol: impl Into<String>, levels: Vec<f64>, base_position_size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            leverage: 10,
            base_position_size,
            qty_step: default_qty_step(),
            max_positions: 5,
            levels,
            stop_loss_pct: 0.05,
            take_profit_step_multiplier: 0.95,
            cover_loss: CoverLossPolicy::default(),
            max_daily_loss: 100.0,
            max_position_loss: 50.0,
            crossing_epsilon: default_crossing_epsilon(),
            cooldown_secs: default_cooldown_secs(),
            position_match_tolerance: default_position_match_tolerance(),
            order_timeout_ms: default_order_timeout(),
        }
    }

    /// Evenly spaced levels `step, 2*step, ..., count*step`
    pub fn stepped_levels(step: f64, count: u32) -> Vec<f64> {
        (1..=count).map(|i| step * i as f64).collect()
    }

    /// Builder: set leverage
    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    /// Builder: set maximum open positions
    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    /// Builder: set stop-loss percentage and take-profit grid-step multiplier
    pub fn with_exits(mut self, stop_loss_pct: f64, take_profit_step_multiplier: f64) -> Self {
        self.stop_loss_pct = stop_loss_pct;
        self.take_profit_step_multiplier = take_profit_step_multiplier;
        self
    }

    /// Builder: set cover-loss factor and cap
    pub fn with_cover_loss(mut self, loss_factor: f64, max_multiplier: f64) -> Self {
        self.cover_loss = CoverLossPolicy::new(loss_factor, max_multiplier);
        self
    }

    /// Builder: set risk limits
    pub fn with_risk_limits(mut self, max_daily_loss: f64, max_position_loss: f64) -> Self {
        self.max_daily_loss = max_daily_loss;
        self.max_position_loss = max_position_loss;
        self
    }

    /// Builder: set crossing detection parameters
    pub fn with_crossing(mut self, epsilon: f64, cooldown_secs: f64) -> Self {
        self.crossing_epsilon = epsilon;
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// Builder: set the exchange quantity increment
    pub fn with_qty_step(mut self, qty_step: f64) -> Self {
        self.qty_step = qty_step;
        self
    }

    /// Builder: set order timeout
    pub fn with_order_timeout(mut self, timeout_ms: u64) -> Self {
        self.order_timeout_ms = timeout_ms;
        self
    }

    /// Cooldown as a chrono duration
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.cooldown_secs * 1000.0).round() as i64)
    }

    /// Truncate `qty` down to a multiple of `qty_step`
    pub fn round_qty(&self, qty: f64) -> f64 {
        // tolerance absorbs products like 0.01 * 1.5 landing just under a step
        let steps = (qty / self.qty_step + 1e-9).floor();
        let decimals = (-self.qty_step.log10()).ceil().max(0.0) as i32;
        let scale = 10f64.powi(decimals);
        (steps * self.qty_step * scale).round() / scale
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::Configuration("symbol cannot be empty".into()));
        }

        if self.leverage == 0 || self.leverage > 100 {
            return Err(GridError::Configuration(
                "leverage must be between 1 and 100".into(),
            ));
        }

        if !positive(self.base_position_size) {
            return Err(GridError::Configuration(
                "base_position_size must be positive".into(),
            ));
        }

        if !positive(self.qty_step) {
            return Err(GridError::Configuration("qty_step must be positive".into()));
        }

        if self.round_qty(self.base_position_size) <= 0.0 {
            return Err(GridError::Configuration(format!(
                "base_position_size {} is below qty_step {}",
                self.base_position_size, self.qty_step
            )));
        }

        if self.max_positions == 0 {
            return Err(GridError::Configuration(
                "max_positions must be at least 1".into(),
            ));
        }

        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 1.0) {
            return Err(GridError::Configuration(
                "stop_loss_pct must be in (0.0, 1.0)".into(),
            ));
        }

        if !positive(self.take_profit_step_multiplier) {
            return Err(GridError::Configuration(
                "take_profit_step_multiplier must be positive".into(),
            ));
        }

        if !at_least_one(self.cover_loss.loss_factor) {
            return Err(GridError::Configuration(
                "cover-loss factor must be at least 1.0".into(),
            ));
        }

        if !at_least_one(self.cover_loss.max_multiplier) {
            return Err(GridError::Configuration(
                "cover-loss max multiplier must be at least 1.0".into(),
            ));
        }

        if !positive(self.max_daily_loss) || !positive(self.max_position_loss) {
            return Err(GridError::Configuration(
                "risk limits must be positive".into(),
            ));
        }

        GridTable::build(&self.levels)?;

        if !positive(self.crossing_epsilon) || !non_negative(self.cooldown_secs) {
            return Err(GridError::Configuration(
                "crossing_epsilon must be positive and cooldown_secs non-negative".into(),
            ));
        }

        Ok(())
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

// NaN fails every check below

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn at_least_one(value: f64) -> bool {
    value.is_finite() && value >= 1.0
}
