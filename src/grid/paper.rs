//! Paper trading: real market data, simulated fills

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use tokio::sync::Mutex;

use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::types::{
    ExchangePosition, OrderAck, OrderBook, OrderRecord, OrderRequest, PositionSide, Ticker,
};

/// Aggregate simulated exposure on one side
#[derive(Debug, Clone, Copy, Default)]
struct PaperBook {
    size: f64,
    entry_price: f64,
}

impl PaperBook {
    fn add(&mut self, qty: f64, price: f64) {
        let total = self.size + qty;
        self.entry_price = (self.entry_price * self.size + price * qty) / total;
        self.size = total;
    }

    /// Remove `qty` at `price`, returning the realized PnL for `side`
    fn reduce(&mut self, side: PositionSide, qty: f64, price: f64) -> f64 {
        let pnl = match side {
            PositionSide::Long => (price - self.entry_price) * qty,
            PositionSide::Short => (self.entry_price - price) * qty,
        };
        self.size -= qty;
        if self.size <= f64::EPSILON {
            *self = Self::default();
        }
        pnl
    }
}

#[derive(Debug, Default)]
struct PaperState {
    long: PaperBook,
    short: PaperBook,
    history: Vec<OrderRecord>,
    realized_pnl: f64,
    leverage: Option<u32>,
}

/// Exchange that reads prices from `inner` and fills every order instantly
/// at the last ticker price. Long and short exposure are tracked separately.
pub struct PaperExchange<E: GridExchange> {
    inner: Arc<E>,
    state: Mutex<PaperState>,
    next_oid: AtomicU64,
}

impl<E: GridExchange> PaperExchange<E> {
    pub fn new(inner: Arc<E>) -> Self {
        info!("Paper trading enabled: orders are simulated locally");
        Self {
            inner,
            state: Mutex::new(PaperState::default()),
            next_oid: AtomicU64::new(1),
        }
    }

    /// Realized PnL of all simulated closes
    pub async fn realized_pnl(&self) -> f64 {
        self.state.lock().await.realized_pnl
    }

    pub async fn leverage(&self) -> Option<u32> {
        self.state.lock().await.leverage
    }
}

#[async_trait]
impl<E: GridExchange> GridExchange for PaperExchange<E> {
    async fn get_ticker(&self, symbol: &str) -> GridResult<Ticker> {
        self.inner.get_ticker(symbol).await
    }

    async fn get_positions(&self, _symbol: &str) -> GridResult<Vec<ExchangePosition>> {
        let state = self.state.lock().await;
        let books = [(PositionSide::Long, state.long), (PositionSide::Short, state.short)];

        Ok(books
            .into_iter()
            .filter(|(_, book)| book.size > 0.0)
            .map(|(side, book)| ExchangePosition {
                side,
                size: book.size,
                entry_price: book.entry_price,
                unrealized_pnl: 0.0,
                stop_loss: None,
                take_profit: None,
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> GridResult<OrderAck> {
        if order.qty <= 0.0 {
            return Err(GridError::rejected(format!("invalid qty {}", order.qty)));
        }

        let price = self.inner.get_ticker(&order.symbol).await?.price;
        let mut state = self.state.lock().await;

        if order.reduce_only {
            // a reduce-only Sell closes longs, a Buy closes shorts
            let side = PositionSide::from(order.side.opposite());
            let book = match side {
                PositionSide::Long => &mut state.long,
                PositionSide::Short => &mut state.short,
            };
            if order.qty > book.size + 1e-12 {
                return Err(GridError::rejected(format!(
                    "reduce-only qty {} exceeds {:?} position {}",
                    order.qty, side, book.size
                )));
            }
            let qty = order.qty.min(book.size);
            let pnl = book.reduce(side, qty, price);
            state.realized_pnl += pnl;
            debug!("Paper close {:?} {} @ {} pnl {:.4}", side, order.qty, price, pnl);
        } else {
            let side = PositionSide::from(order.side);
            match side {
                PositionSide::Long => state.long.add(order.qty, price),
                PositionSide::Short => state.short.add(order.qty, price),
            }
            debug!("Paper open {:?} {} @ {}", side, order.qty, price);
        }

        let order_id = format!("paper-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
        state.history.push(OrderRecord {
            order_id: order_id.clone(),
            side: order.side,
            qty: order.qty,
            avg_price: price,
            status: "Filled".into(),
            created_at: Utc::now(),
        });

        Ok(OrderAck { order_id })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<()> {
        // fills are immediate, nothing ever rests
        debug!("Paper cancel-all for {}", symbol);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()> {
        self.state.lock().await.leverage = Some(leverage);
        info!("Paper leverage for {} set to {}x", symbol, leverage);
        Ok(())
    }

    async fn get_order_history(&self, _symbol: &str, limit: usize) -> GridResult<Vec<OrderRecord>> {
        let state = self.state.lock().await;
        Ok(state.history.iter().rev().take(limit).cloned().collect())
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> GridResult<OrderBook> {
        self.inner.get_orderbook(symbol, depth).await
    }
}
