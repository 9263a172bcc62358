use std::path::PathBuf;

use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{BybitConfig, BybitCredentials, GridConfig, GridError, GridResult, RunnerConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Exchange connection (testnet flag, optional keys)
    #[serde(default)]
    pub api: ApiConfig,
    /// What to trade and how large
    pub trading: TradingConfig,
    /// Grid level layout and crossing detection
    #[serde(default)]
    pub grid: GridLevelsConfig,
    #[serde(default)]
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub take_profit: TakeProfitConfig,
    #[serde(default)]
    pub cover_loss: CoverLossConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    /// Loop timing and status output
    #[serde(default)]
    pub runner: RunnerSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub testnet: bool,
    /// Prefer BYBIT_API_KEY / BYBIT_API_SECRET over putting keys here
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Account position mode; the grid holds longs and shorts side by side
    #[serde(default = "default_true")]
    pub hedge_mode: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            testnet: true,
            api_key: None,
            api_secret: None,
            hedge_mode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Orders go to the exchange
    Live,
    /// Orders are filled locally against live prices
    Paper,
}

#[derive(Debug, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    pub position_size: f64,
    /// Quantity increment of the contract
    #[serde(default = "default_qty_step")]
    pub qty_step: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
}

/// Explicit `levels`, or `count` levels spaced `step` apart starting at `step`
#[derive(Debug, Deserialize)]
pub struct GridLevelsConfig {
    #[serde(default)]
    pub levels: Option<Vec<f64>>,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_epsilon")]
    pub crossing_epsilon: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: f64,
}

impl Default for GridLevelsConfig {
    fn default() -> Self {
        Self {
            levels: None,
            step: default_step(),
            count: default_count(),
            crossing_epsilon: default_epsilon(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl GridLevelsConfig {
    pub fn resolve(&self) -> Vec<f64> {
        match &self.levels {
            Some(levels) if !levels.is_empty() => levels.clone(),
            _ => GridConfig::stepped_levels(self.step, self.count),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StopLossConfig {
    /// Percent of entry price (5.0 = 5%)
    #[serde(default = "default_stop_loss")]
    pub percentage: f64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            percentage: default_stop_loss(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TakeProfitConfig {
    /// Fraction of the grid step between entry and target
    #[serde(default = "default_take_profit")]
    pub grid_step_multiplier: f64,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            grid_step_multiplier: default_take_profit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CoverLossConfig {
    #[serde(default = "default_loss_factor")]
    pub multiplier: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
}

impl Default for CoverLossConfig {
    fn default() -> Self {
        Self {
            multiplier: default_loss_factor(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_position_loss")]
    pub max_position_loss: f64,
    /// Close everything on a breach; otherwise the grid is paused
    #[serde(default = "default_true")]
    pub emergency_stop: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_loss: default_max_position_loss(),
            emergency_stop: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_poll_ms")]
    pub price_poll_interval_ms: u64,
    #[serde(default = "default_risk_secs")]
    pub risk_check_interval_secs: u64,
    #[serde(default = "default_status_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_max_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_ms: u64,
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            price_poll_interval_ms: default_poll_ms(),
            risk_check_interval_secs: default_risk_secs(),
            status_interval_secs: default_status_secs(),
            max_consecutive_errors: default_max_errors(),
            order_timeout_ms: default_order_timeout(),
            status_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_leverage() -> u32 {
    10
}

fn default_qty_step() -> f64 {
    0.001
}

fn default_max_positions() -> usize {
    5
}

fn default_mode() -> TradingMode {
    TradingMode::Paper
}

fn default_step() -> f64 {
    1000.0
}

fn default_count() -> u32 {
    10
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_cooldown() -> f64 {
    1.0
}

fn default_stop_loss() -> f64 {
    5.0
}

fn default_take_profit() -> f64 {
    0.95
}

fn default_loss_factor() -> f64 {
    1.5
}

fn default_max_multiplier() -> f64 {
    3.0
}

fn default_max_daily_loss() -> f64 {
    100.0
}

fn default_max_position_loss() -> f64 {
    50.0
}

fn default_poll_ms() -> u64 {
    100
}

fn default_risk_secs() -> u64 {
    5
}

fn default_status_secs() -> u64 {
    60
}

fn default_max_errors() -> u32 {
    10
}

fn default_order_timeout() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment variables override the file
            // e.g. APP__RISK__MAX_DAILY_LOSS=50
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Parse settings from an in-memory document
    pub fn from_document(content: &str, format: FileFormat) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()
    }

    /// Controller-facing configuration, validated
    pub fn grid_config(&self) -> GridResult<GridConfig> {
        let config = GridConfig::new(
            &self.trading.symbol,
            self.grid.resolve(),
            self.trading.position_size,
        )
        .with_leverage(self.trading.leverage)
        .with_qty_step(self.trading.qty_step)
        .with_max_positions(self.trading.max_positions)
        .with_exits(
            self.stop_loss.percentage / 100.0,
            self.take_profit.grid_step_multiplier,
        )
        .with_cover_loss(self.cover_loss.multiplier, self.cover_loss.max_multiplier)
        .with_risk_limits(self.risk.max_daily_loss, self.risk.max_position_loss)
        .with_crossing(self.grid.crossing_epsilon, self.grid.cooldown_secs)
        .with_order_timeout(self.runner.order_timeout_ms);

        config.validate()?;
        Ok(config)
    }

    pub fn bybit_config(&self) -> BybitConfig {
        BybitConfig::new(self.api.testnet).with_hedge_mode(self.api.hedge_mode)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            price_poll_interval_ms: self.runner.price_poll_interval_ms,
            risk_check_interval_secs: self.runner.risk_check_interval_secs,
            status_interval_secs: self.runner.status_interval_secs,
            max_consecutive_errors: self.runner.max_consecutive_errors,
            emergency_stop: self.risk.emergency_stop,
            status_file: self.runner.status_file.clone(),
            ..RunnerConfig::default()
        }
    }

    /// Keys from the file when both are present, otherwise from the environment
    pub fn credentials(&self) -> GridResult<BybitCredentials> {
        match (&self.api.api_key, &self.api.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Ok(BybitCredentials::new(key, secret))
            }
            _ => BybitCredentials::from_env().map_err(|e| {
                GridError::Configuration(format!("no API credentials in config or environment: {}", e))
            }),
        }
    }
}
