//! Exchange abstraction for grid trading - enables mocking for tests

use async_trait::async_trait;

use super::errors::GridResult;
use super::types::{ExchangePosition, OrderAck, OrderBook, OrderRecord, OrderRequest, Ticker};

/// Exchange operations consumed by the grid controller.
///
/// Every call is fallible; a timeout or transport failure must be treated
/// exactly like a rejection.
#[async_trait]
pub trait GridExchange: Send + Sync {
    /// Last traded price and 24h statistics
    async fn get_ticker(&self, symbol: &str) -> GridResult<Ticker>;

    /// Open positions for a symbol
    async fn get_positions(&self, symbol: &str) -> GridResult<Vec<ExchangePosition>>;

    /// Submit an order
    async fn place_order(&self, order: &OrderRequest) -> GridResult<OrderAck>;

    /// Cancel every resting order for a symbol
    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<()>;

    /// Update leverage for a symbol
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()>;

    /// Most recent orders, newest first
    async fn get_order_history(&self, symbol: &str, limit: usize) -> GridResult<Vec<OrderRecord>>;

    /// Order book snapshot of the given depth
    async fn get_orderbook(&self, symbol: &str, depth: usize) -> GridResult<OrderBook>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for testing the controller without a real exchange connection.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::Mutex;

    use crate::grid::errors::GridError;
    use crate::grid::types::{BookLevel, OrderSide};

    /// Mock exchange for testing
    pub struct MockExchange {
        pub orders: Arc<Mutex<Vec<OrderRequest>>>,
        pub ticker: Arc<Mutex<Ticker>>,
        pub positions: Arc<Mutex<Vec<ExchangePosition>>>,
        pub leverage_calls: Arc<Mutex<Vec<u32>>>,
        pub cancel_all_calls: Arc<Mutex<u32>>,
        next_oid: AtomicU64,
        /// Reject every order
        pub should_fail: Arc<Mutex<bool>>,
        /// Reject only reduce-only (closing) orders
        pub fail_closes: Arc<Mutex<bool>>,
        /// Reject only opening orders
        pub fail_opens: Arc<Mutex<bool>>,
        /// Delay every order acknowledgment by this many milliseconds
        pub order_delay_ms: Arc<Mutex<u64>>,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                orders: Arc::new(Mutex::new(Vec::new())),
                ticker: Arc::new(Mutex::new(Ticker {
                    price,
                    ..Ticker::default()
                })),
                positions: Arc::new(Mutex::new(Vec::new())),
                leverage_calls: Arc::new(Mutex::new(Vec::new())),
                cancel_all_calls: Arc::new(Mutex::new(0)),
                next_oid: AtomicU64::new(1),
                should_fail: Arc::new(Mutex::new(false)),
                fail_closes: Arc::new(Mutex::new(false)),
                fail_opens: Arc::new(Mutex::new(false)),
                order_delay_ms: Arc::new(Mutex::new(0)),
            }
        }

        pub async fn set_price(&self, price: f64) {
            self.ticker.lock().await.price = price;
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn set_fail_closes(&self, fail: bool) {
            *self.fail_closes.lock().await = fail;
        }

        pub async fn set_fail_opens(&self, fail: bool) {
            *self.fail_opens.lock().await = fail;
        }

        pub async fn set_order_delay_ms(&self, delay: u64) {
            *self.order_delay_ms.lock().await = delay;
        }

        pub async fn order_count(&self) -> usize {
            self.orders.lock().await.len()
        }
    }

    #[async_trait]
    impl GridExchange for MockExchange {
        async fn get_ticker(&self, _symbol: &str) -> GridResult<Ticker> {
            if *self.should_fail.lock().await {
                return Err(GridError::Network("Mock failure".into()));
            }
            Ok(*self.ticker.lock().await)
        }

        async fn get_positions(&self, _symbol: &str) -> GridResult<Vec<ExchangePosition>> {
            Ok(self.positions.lock().await.clone())
        }

        async fn place_order(&self, order: &OrderRequest) -> GridResult<OrderAck> {
            let delay = *self.order_delay_ms.lock().await;
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let fail = *self.should_fail.lock().await
                || (order.reduce_only && *self.fail_closes.lock().await)
                || (!order.reduce_only && *self.fail_opens.lock().await);
            if fail {
                return Err(GridError::rejected("Mock failure"));
            }

            self.orders.lock().await.push(order.clone());
            let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);

            Ok(OrderAck {
                order_id: format!("mock-{}", oid),
            })
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> GridResult<()> {
            *self.cancel_all_calls.lock().await += 1;
            Ok(())
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> GridResult<()> {
            self.leverage_calls.lock().await.push(leverage);
            Ok(())
        }

        async fn get_order_history(&self, _symbol: &str, limit: usize) -> GridResult<Vec<OrderRecord>> {
            let price = self.ticker.lock().await.price;
            let orders = self.orders.lock().await;
            Ok(orders
                .iter()
                .enumerate()
                .rev()
                .take(limit)
                .map(|(i, o)| OrderRecord {
                    order_id: format!("mock-{}", i + 1),
                    side: o.side,
                    qty: o.qty,
                    avg_price: price,
                    status: "Filled".into(),
                    created_at: Utc::now(),
                })
                .collect())
        }

        async fn get_orderbook(&self, _symbol: &str, depth: usize) -> GridResult<OrderBook> {
            let price = self.ticker.lock().await.price;
            let level = |side: OrderSide, i: usize| BookLevel {
                price: match side {
                    OrderSide::Buy => price - 0.5 * (i + 1) as f64,
                    OrderSide::Sell => price + 0.5 * (i + 1) as f64,
                },
                size: 1.0,
            };
            Ok(OrderBook {
                bids: (0..depth).map(|i| level(OrderSide::Buy, i)).collect(),
                asks: (0..depth).map(|i| level(OrderSide::Sell, i)).collect(),
            })
        }
    }
}
