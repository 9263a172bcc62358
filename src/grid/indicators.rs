//! Rolling price history with the simple indicators shown on the status report

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Samples used for the volatility classification
const VOLATILITY_WINDOW: usize = 10;

/// Coarse volatility bucket from the coefficient of variation of recent prices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Volatility {
    Low,
    Medium,
    High,
}

/// Upper / middle / lower Bollinger bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Indicator values at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub samples: usize,
    pub sma: Option<f64>,
    pub rsi: f64,
    pub volatility: Volatility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bollinger: Option<Bands>,
}

/// Fixed-capacity ring buffer of recent prices. The oldest sample is dropped
/// once capacity is reached.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    prices: VecDeque<f64>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// The most recent `n` samples, oldest first
    fn recent(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.prices.len().saturating_sub(n);
        self.prices.iter().skip(skip).copied()
    }

    /// Mean of the whole window
    pub fn sma(&self) -> Option<f64> {
        if self.prices.is_empty() {
            return None;
        }
        Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
    }

    /// RSI over the last `period` samples.
    ///
    /// Gains and losses are each averaged over the moves that produced them.
    /// Neutral 50 until `period` samples exist; 100 when nothing went down.
    pub fn rsi(&self, period: usize) -> f64 {
        if period < 2 || self.prices.len() < period {
            return 50.0;
        }

        let window: Vec<f64> = self.recent(period).collect();
        let (mut gains, mut losses) = (Vec::new(), Vec::new());
        for pair in window.windows(2) {
            let change = pair[1] - pair[0];
            if change > 0.0 {
                gains.push(change);
            } else if change < 0.0 {
                losses.push(-change);
            }
        }

        if losses.is_empty() {
            return 100.0;
        }

        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        let rs = mean(&gains) / mean(&losses);
        (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
    }

    /// Classification of the last ten prices: stddev/mean above 5% is High,
    /// above 2% Medium. Fewer than ten samples reads as Low.
    pub fn volatility(&self) -> Volatility {
        if self.prices.len() < VOLATILITY_WINDOW {
            return Volatility::Low;
        }

        let window: Vec<f64> = self.recent(VOLATILITY_WINDOW).collect();
        let (mean, std_dev) = mean_and_std(&window);
        let percent = if mean > 0.0 { std_dev / mean * 100.0 } else { 0.0 };

        if percent > 5.0 {
            Volatility::High
        } else if percent > 2.0 {
            Volatility::Medium
        } else {
            Volatility::Low
        }
    }

    /// Bands `k` standard deviations around the `period` SMA
    pub fn bollinger(&self, period: usize, k: f64) -> Option<Bands> {
        if period == 0 || self.prices.len() < period {
            return None;
        }

        let window: Vec<f64> = self.recent(period).collect();
        let (middle, std_dev) = mean_and_std(&window);
        Some(Bands {
            upper: middle + k * std_dev,
            middle,
            lower: middle - k * std_dev,
        })
    }

    pub fn snapshot(&self, rsi_period: usize) -> IndicatorSnapshot {
        IndicatorSnapshot {
            samples: self.prices.len(),
            sma: self.sma(),
            rsi: self.rsi(rsi_period),
            volatility: self.volatility(),
            bollinger: self.bollinger(20, 2.0),
        }
    }
}

/// Population mean and standard deviation
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
