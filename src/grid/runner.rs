//! Grid bot runner - main execution loop

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};

use super::controller::GridController;
use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::indicators::{IndicatorSnapshot, PriceHistory};
use super::types::StatusSnapshot;

/// Grid bot runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub price_poll_interval_ms: u64,
    pub risk_check_interval_secs: u64,
    pub status_interval_secs: u64,
    pub max_consecutive_errors: u32,
    /// Close everything on a risk breach instead of pausing the grid
    pub emergency_stop: bool,
    pub status_file: Option<PathBuf>,
    pub history_capacity: usize,
    pub rsi_period: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            price_poll_interval_ms: 100,
            risk_check_interval_secs: 5,
            status_interval_secs: 60,
            max_consecutive_errors: 10,
            emergency_stop: true,
            status_file: None,
            history_capacity: 100,
            rsi_period: 14,
        }
    }
}

/// Status snapshot plus indicators, as written to the status file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: StatusSnapshot,
    pub indicators: IndicatorSnapshot,
    pub written_at: DateTime<Utc>,
}

impl StatusReport {
    /// Save to file atomically (write to temp, then rename)
    pub fn save_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Requests a graceful stop of a running `GridRunner`
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    stop: Arc<Notify>,
}

impl RunnerHandle {
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

/// Drives one symbol: polls the ticker, feeds the controller, watches risk,
/// publishes status.
pub struct GridRunner<E: GridExchange> {
    controller: GridController<E>,
    config: RunnerConfig,
    history: PriceHistory,
    status_tx: watch::Sender<StatusSnapshot>,
    stop: Arc<Notify>,
    levels_paused: bool,
}

impl<E: GridExchange + 'static> GridRunner<E> {
    pub fn new(controller: GridController<E>, config: RunnerConfig) -> Self {
        let (status_tx, _) = watch::channel(controller.get_status());
        Self {
            history: PriceHistory::new(config.history_capacity),
            controller,
            config,
            status_tx,
            stop: Arc::new(Notify::new()),
            levels_paused: false,
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            stop: self.stop.clone(),
        }
    }

    /// Receive every published status snapshot
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn controller(&self) -> &GridController<E> {
        &self.controller
    }

    pub fn history(&self) -> &PriceHistory {
        &self.history
    }

    /// Run until stopped, interrupted, a risk breach with emergency stop, or
    /// too many consecutive tick failures. Open orders are cancelled on the
    /// way out in every case.
    pub async fn run(&mut self) -> GridResult<()> {
        let symbol = self.controller.config().symbol.clone();
        info!("Starting grid runner for {}", symbol);
        self.controller.initialize().await?;

        let mut poll_timer = interval(Duration::from_millis(self.config.price_poll_interval_ms.max(1)));
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut risk_timer = interval(Duration::from_secs(self.config.risk_check_interval_secs.max(1)));
        let mut status_timer = interval(Duration::from_secs(self.config.status_interval_secs.max(1)));

        let stop = self.stop.clone();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ctrl_c_armed = true;

        let mut consecutive_errors = 0u32;

        let result = loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    match self.poll_once().await {
                        Ok(()) => consecutive_errors = 0,
                        Err(e) => {
                            error!("Error processing tick: {}", e);
                            consecutive_errors += 1;
                        }
                    }
                }
                _ = risk_timer.tick() => {
                    if let Err(e) = self.check_risk().await {
                        break Err(e);
                    }
                }
                _ = status_timer.tick() => self.publish_status(),
                signal = &mut ctrl_c, if ctrl_c_armed => match signal {
                    Ok(()) => {
                        info!("Received Ctrl-C, shutting down");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!("Ctrl-C handler unavailable: {}", e);
                        ctrl_c_armed = false;
                    }
                },
                _ = stop.notified() => {
                    info!("Stop requested");
                    break Ok(());
                }
            }

            if consecutive_errors >= self.config.max_consecutive_errors {
                error!("Too many errors ({} in a row), shutting down", consecutive_errors);
                break Err(GridError::Network(format!(
                    "{} consecutive tick failures",
                    consecutive_errors
                )));
            }
        };

        self.shutdown().await;
        result
    }

    async fn poll_once(&mut self) -> GridResult<()> {
        let symbol = self.controller.config().symbol.clone();
        let ticker = self.controller.exchange().get_ticker(&symbol).await?;

        self.history.push(ticker.price);
        let outcome = self.controller.update_price(ticker.price, Utc::now()).await;

        if !outcome.opened.is_empty() || !outcome.reversed.is_empty() || !outcome.closed.is_empty() {
            debug!(
                "Tick {}: opened {}, reversed {}, closed {}",
                ticker.price,
                outcome.opened.len(),
                outcome.reversed.len(),
                outcome.closed.len()
            );
        }

        match outcome.errors.into_iter().find(|e| e.is_exchange_failure()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// On a breach either flatten and fail, or pause the grid until the
    /// breach clears.
    async fn check_risk(&mut self) -> GridResult<()> {
        match self.controller.risk_breach() {
            Some(breach) => {
                warn!("Risk limit breached: {}", breach);
                if self.config.emergency_stop {
                    if let Err(e) = self.controller.emergency_stop().await {
                        error!("Emergency stop incomplete: {}", e);
                    }
                    return Err(breach);
                }
                if !self.levels_paused {
                    self.controller.set_levels_active(false);
                    self.levels_paused = true;
                }
            }
            None if self.levels_paused => {
                info!("Risk back within limits, resuming grid");
                self.controller.set_levels_active(true);
                self.levels_paused = false;
            }
            None => {}
        }
        Ok(())
    }

    fn publish_status(&mut self) {
        let status = self.controller.get_status();
        info!(
            "Status: price {}, positions {}, total PnL {:.2}, daily PnL {:.2}, trades {}, multiplier {:.2}",
            status
                .current_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            status.active_positions,
            status.total_pnl,
            status.daily_pnl,
            status.trade_count,
            status.current_size_multiplier
        );

        if let Some(path) = &self.config.status_file {
            let report = StatusReport {
                status: status.clone(),
                indicators: self.history.snapshot(self.config.rsi_period),
                written_at: Utc::now(),
            };
            if let Err(e) = report.save_atomic(path) {
                warn!("Failed to write status file {:?}: {}", path, e);
            }
        }

        self.status_tx.send_replace(status);
    }

    async fn shutdown(&mut self) {
        let symbol = self.controller.config().symbol.clone();
        if let Err(e) = self.controller.exchange().cancel_all_orders(&symbol).await {
            error!("Failed to cancel open orders on shutdown: {}", e);
        }
        self.publish_status();
        info!("Grid runner for {} stopped", symbol);
    }
}
