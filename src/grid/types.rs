//! Core data types for grid trading

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange order identifier, also used as the position key
pub type OrderId = String;

/// Order side as understood by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Side of the order that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that flattens a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl From<OrderSide> for PositionSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    EmergencyStop,
}

/// Request to place an order on the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    /// Limit price (ignored for market orders)
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Close orders only reduce an existing position
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Market order opening a position
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
        }
    }

    /// Reduce-only market order flattening `qty` of a position on `side`
    pub fn close(symbol: impl Into<String>, side: PositionSide, qty: f64) -> Self {
        Self::market(symbol, side.exit_side(), qty).reduce_only(true)
    }

    /// Attach stop-loss / take-profit brackets
    pub fn with_brackets(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    /// Set reduce_only flag
    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    /// Position this order opens or reduces
    pub fn position_side(&self) -> PositionSide {
        match (self.side, self.reduce_only) {
            (OrderSide::Buy, false) | (OrderSide::Sell, true) => PositionSide::Long,
            (OrderSide::Sell, false) | (OrderSide::Buy, true) => PositionSide::Short,
        }
    }
}

/// Acknowledgment of an accepted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: OrderId,
}

/// 24h ticker for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub price: f64,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Historical order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub qty: f64,
    pub avg_price: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// One price level of an order book side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Best bid first
    pub bids: Vec<BookLevel>,
    /// Best ask first
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }
}

/// Open position tracked by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub exchange_order_id: OrderId,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Mark the position to a new price
    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
        };
    }

    /// Exit condition breached at `price`, if any. Stop-loss is checked first.
    pub fn exit_trigger(&self, price: f64) -> Option<CloseReason> {
        let stop_hit = self.stop_loss.is_some_and(|sl| match self.side {
            PositionSide::Long => price <= sl,
            PositionSide::Short => price >= sl,
        });
        if stop_hit {
            return Some(CloseReason::StopLoss);
        }

        let target_hit = self.take_profit.is_some_and(|tp| match self.side {
            PositionSide::Long => price >= tp,
            PositionSide::Short => price <= tp,
        });
        target_hit.then_some(CloseReason::TakeProfit)
    }
}

/// Snapshot exposed to dashboards and monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub trade_count: u64,
    pub active_positions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    pub current_size_multiplier: f64,
    pub consecutive_losses: u32,
    /// Percentage of closes with positive PnL
    #[serde(default)]
    pub win_rate: f64,
    pub grid_level_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price_update: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: PositionSide) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side,
            size: 0.01,
            entry_price: 46000.0,
            current_price: 46000.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
            exchange_order_id: "1".into(),
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_unrealized_pnl_sign() {
        let mut long = position(PositionSide::Long);
        long.update_price(45000.0);
        assert!((long.unrealized_pnl - -10.0).abs() < 1e-9);

        let mut short = position(PositionSide::Short);
        short.update_price(45000.0);
        assert!((short.unrealized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_trigger() {
        let mut long = position(PositionSide::Long);
        long.stop_loss = Some(43700.0);
        long.take_profit = Some(46950.0);
        assert_eq!(long.exit_trigger(46000.0), None);
        assert_eq!(long.exit_trigger(43700.0), Some(CloseReason::StopLoss));
        assert_eq!(long.exit_trigger(47000.0), Some(CloseReason::TakeProfit));

        let mut short = position(PositionSide::Short);
        short.stop_loss = Some(48300.0);
        short.take_profit = Some(45050.0);
        assert_eq!(short.exit_trigger(48300.0), Some(CloseReason::StopLoss));
        assert_eq!(short.exit_trigger(45000.0), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn test_close_request_flips_side() {
        let req = OrderRequest::close("BTCUSDT", PositionSide::Long, 0.01);
        assert_eq!(req.side, OrderSide::Sell);
        assert!(req.reduce_only);
        assert_eq!(req.order_type, OrderType::Market);
    }

    #[test]
    fn test_position_side_of_orders() {
        let open_long = OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.01);
        let open_short = OrderRequest::market("BTCUSDT", OrderSide::Sell, 0.01);
        assert_eq!(open_long.position_side(), PositionSide::Long);
        assert_eq!(open_short.position_side(), PositionSide::Short);

        let close_long = OrderRequest::close("BTCUSDT", PositionSide::Long, 0.01);
        let close_short = OrderRequest::close("BTCUSDT", PositionSide::Short, 0.01);
        assert_eq!(close_long.position_side(), PositionSide::Long);
        assert_eq!(close_short.position_side(), PositionSide::Short);
    }
}
