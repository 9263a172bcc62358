//! Cover-loss position sizing and performance counters

use serde::{Deserialize, Serialize};

/// Decay applied to the multiplier after a winning or break-even close
pub const WIN_DECAY: f64 = 0.9;

/// Multiplier growth after losses, bounded to `[1.0, max_multiplier]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverLossPolicy {
    pub loss_factor: f64,
    pub max_multiplier: f64,
}

impl Default for CoverLossPolicy {
    fn default() -> Self {
        Self {
            loss_factor: 1.5,
            max_multiplier: 3.0,
        }
    }
}

impl CoverLossPolicy {
    pub fn new(loss_factor: f64, max_multiplier: f64) -> Self {
        Self {
            loss_factor,
            max_multiplier,
        }
    }

    /// Multiplier to use after a close with realized `pnl`
    pub fn next_multiplier(&self, current: f64, pnl: f64) -> f64 {
        if pnl < 0.0 {
            (current * self.loss_factor).min(self.max_multiplier)
        } else {
            (current * WIN_DECAY).max(1.0)
        }
    }
}

/// PnL and sizing statistics, mutated only after an acknowledged close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub trade_count: u64,
    /// Closes with strictly positive PnL
    #[serde(default)]
    pub winning_trades: u64,
    pub consecutive_losses: u32,
    pub current_size_multiplier: f64,
}

impl Default for PerformanceCounters {
    fn default() -> Self {
        Self {
            total_pnl: 0.0,
            daily_pnl: 0.0,
            trade_count: 0,
            winning_trades: 0,
            consecutive_losses: 0,
            current_size_multiplier: 1.0,
        }
    }
}

impl PerformanceCounters {
    /// Account for one closed position
    pub fn record_close(&mut self, pnl: f64, policy: &CoverLossPolicy) {
        self.total_pnl += pnl;
        self.daily_pnl += pnl;
        self.trade_count += 1;
        if pnl > 0.0 {
            self.winning_trades += 1;
        }

        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
        self.current_size_multiplier = policy.next_multiplier(self.current_size_multiplier, pnl);
    }

    pub fn reset_daily(&mut self) {
        self.daily_pnl = 0.0;
    }

    /// Winning closes as a percentage of all closes, 0 before the first close
    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.trade_count as f64 * 100.0
    }
}
