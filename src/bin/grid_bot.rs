//! Grid Reversal Bot Binary
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root:
//!    ```
//!    BYBIT_API_KEY=yourkey
//!    BYBIT_API_SECRET=yoursecret
//!    ```
//!
//! 2. Copy `config.example.yaml` to `config.yaml` and adjust it.
//!
//! 3. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config.yaml
//!    ```
//!
//! Any setting can be overridden from the environment, e.g.
//! `APP__TRADING__MODE=paper`.

use std::env;
use std::process;
use std::sync::Arc;

use log::{error, info, warn};

use bybit_grid_bot::config::{Settings, TradingMode};
use bybit_grid_bot::grid::{
    BybitCredentials, BybitExchange, GridController, GridExchange, GridResult,
    GridRunner, PaperExchange,
};

const DEFAULT_CONFIG: &str = "config.yaml";

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        DEFAULT_CONFIG.to_string()
    };

    let settings = Settings::new(&config_path);
    let default_level = settings
        .as_ref()
        .map(|s| s.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load config from {}: {}", config_path, e);
            process::exit(1);
        }
    };

    if let Err(e) = run(settings).await {
        error!("Grid bot stopped with error: {}", e);
        process::exit(1);
    }
}

async fn run(settings: Settings) -> GridResult<()> {
    let grid_config = settings.grid_config()?;
    let bybit_config = settings.bybit_config();

    info!("Starting grid bot for {}", grid_config.symbol);
    info!(
        "Grid: {} levels, {} to {}",
        grid_config.levels.len(),
        grid_config.levels.iter().cloned().fold(f64::INFINITY, f64::min),
        grid_config.levels.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    );
    info!(
        "Base size {}, leverage {}x, max positions {}",
        grid_config.base_position_size, grid_config.leverage, grid_config.max_positions
    );

    if settings.api.testnet {
        info!("Using TESTNET");
    } else {
        warn!("Using MAINNET - real funds at risk!");
    }
    if !settings.api.hedge_mode {
        warn!("One-way position mode: opposite grid positions will net against each other");
    }

    match settings.trading.mode {
        TradingMode::Live => {
            let exchange = Arc::new(BybitExchange::new(bybit_config, settings.credentials()?)?);
            run_with(exchange, &settings).await
        }
        TradingMode::Paper => {
            // market data endpoints are public, keys are optional
            let credentials = settings
                .credentials()
                .unwrap_or_else(|_| BybitCredentials::new("", ""));
            let market = Arc::new(BybitExchange::new(bybit_config, credentials)?);
            run_with(Arc::new(PaperExchange::new(market)), &settings).await
        }
    }
}

async fn run_with<E: GridExchange + 'static>(exchange: Arc<E>, settings: &Settings) -> GridResult<()> {
    let controller = GridController::new(settings.grid_config()?, exchange)?;
    let mut runner = GridRunner::new(controller, settings.runner_config());
    runner.run().await?;

    let status = runner.controller().get_status();
    info!(
        "Final: total PnL {:.2}, trades {}, open positions {}",
        status.total_pnl, status.trade_count, status.active_positions
    );
    Ok(())
}
