//! Grid controller - turns price ticks into open / reverse / close decisions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};

use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::sizing::PerformanceCounters;
use super::table::GridTable;
use super::types::{
    CloseReason, OrderAck, OrderId, OrderRequest, Position, PositionSide, StatusSnapshot,
};

/// What a single `update_price` call did
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Positions opened on an empty level
    pub opened: Vec<OrderId>,
    /// Positions opened as the second leg of a reversal
    pub reversed: Vec<OrderId>,
    /// Positions closed on a stop-loss or take-profit
    pub closed: Vec<(OrderId, CloseReason)>,
    /// Failures encountered; none of them aborted the tick
    pub errors: Vec<GridError>,
}

impl TickOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of failures that came from the exchange
    pub fn exchange_failures(&self) -> usize {
        self.errors.iter().filter(|e| e.is_exchange_failure()).count()
    }
}

/// Direction of a crossing of `level` by the move `previous -> price`, or
/// `None` when the move stays on one side. A tick exactly on the level counts
/// as the far side of either move.
fn crossing_direction(price: f64, level: f64, previous: Option<f64>) -> Option<PositionSide> {
    let prev = previous?;
    if price > level && prev <= level {
        return Some(PositionSide::Long);
    }
    if price < level && prev >= level {
        return Some(PositionSide::Short);
    }
    if price == level {
        if prev < level {
            return Some(PositionSide::Long);
        }
        if prev > level {
            return Some(PositionSide::Short);
        }
    }
    None
}

/// Grid position state machine for one symbol.
///
/// All mutation goes through `&mut self`, so ticks are processed strictly one
/// at a time. Exchange calls are the only suspension points and no position is
/// created or removed until the exchange acknowledges the order.
pub struct GridController<E: GridExchange> {
    config: GridConfig,
    exchange: Arc<E>,
    grid: GridTable,
    positions: HashMap<OrderId, Position>,
    counters: PerformanceCounters,
    last_price: Option<f64>,
    last_update: Option<DateTime<Utc>>,
    trading_day: Option<NaiveDate>,
}

impl<E: GridExchange> GridController<E> {
    /// Validate the configuration and build the grid table
    pub fn new(config: GridConfig, exchange: Arc<E>) -> GridResult<Self> {
        config.validate()?;
        let grid = GridTable::build(&config.levels)?;

        info!(
            "Grid controller created for {}: {} levels from {} to {}, step {}",
            config.symbol,
            grid.len(),
            grid.iter().next().map(|l| l.price).unwrap_or_default(),
            grid.iter().last().map(|l| l.price).unwrap_or_default(),
            grid.grid_step()
        );

        Ok(Self {
            config,
            exchange,
            grid,
            positions: HashMap::new(),
            counters: PerformanceCounters::default(),
            last_price: None,
            last_update: None,
            trading_day: None,
        })
    }

    /// Prepare the exchange side: leverage, stale orders, existing positions
    pub async fn initialize(&mut self) -> GridResult<()> {
        let symbol = self.config.symbol.clone();

        info!("Setting leverage to {}x for {}", self.config.leverage, symbol);
        self.exchange.set_leverage(&symbol, self.config.leverage).await?;

        self.exchange.cancel_all_orders(&symbol).await?;

        let adopted = self.load_positions().await?;
        info!(
            "Grid controller initialized: symbol={}, levels={}, adopted positions={}",
            symbol,
            self.grid.len(),
            adopted
        );
        Ok(())
    }

    /// Adopt positions already open on the exchange. Each one is bound to the
    /// nearest free level within `position_match_tolerance` of its entry.
    async fn load_positions(&mut self) -> GridResult<usize> {
        let remote = self.exchange.get_positions(&self.config.symbol).await?;
        let now = Utc::now();
        let mut adopted = 0;

        for (i, p) in remote.into_iter().filter(|p| p.size > 0.0).enumerate() {
            // exchange positions carry no opening order id
            let order_id = format!("adopted-{}", i + 1);
            // mark price implied by the exchange's PnL
            let mark = match p.side {
                PositionSide::Long => p.entry_price + p.unrealized_pnl / p.size,
                PositionSide::Short => p.entry_price - p.unrealized_pnl / p.size,
            };
            let mut position = Position {
                symbol: self.config.symbol.clone(),
                side: p.side,
                size: p.size,
                entry_price: p.entry_price,
                current_price: p.entry_price,
                unrealized_pnl: 0.0,
                realized_pnl: 0.0,
                stop_loss: p.stop_loss,
                take_profit: p.take_profit,
                exchange_order_id: order_id.clone(),
                opened_at: now,
            };
            position.update_price(mark);

            let index = self.grid.nearest_index(p.entry_price);
            let level = self.grid.level(index).cloned();
            match level {
                Some(level)
                    if !level.is_bound()
                        && (level.price - p.entry_price).abs()
                            <= self.config.position_match_tolerance =>
                {
                    self.grid.bind(index, order_id.clone());
                    info!(
                        "Adopted {:?} position size {} @ {} at level {}",
                        p.side, p.size, p.entry_price, level.price
                    );
                }
                _ => warn!(
                    "Adopted {:?} position size {} @ {} matches no grid level",
                    p.side, p.size, p.entry_price
                ),
            }

            self.positions.insert(order_id, position);
            adopted += 1;
        }

        Ok(adopted)
    }

    /// Process one price tick.
    ///
    /// Order: mark positions, scan levels for crossings, then close positions
    /// whose stop-loss or take-profit is breached. Exit candidates are found
    /// before the crossing scan so a position due for a hard exit is closed
    /// rather than reversed.
    pub async fn update_price(&mut self, price: f64, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if !price.is_finite() || price <= 0.0 {
            warn!("Ignoring invalid price {} for {}", price, self.config.symbol);
            return outcome;
        }

        self.roll_trading_day(now);
        let previous = self.last_price.replace(price);
        self.last_update = Some(now);

        for position in self.positions.values_mut() {
            position.update_price(price);
        }

        let exits = self.collect_exits(price);
        let cooldown = self.config.cooldown();

        for index in 0..self.grid.len() {
            let (level_price, active) = match self.grid.level(index) {
                Some(level) => (level.price, level.active),
                None => continue,
            };

            if !active
                || (price - level_price).abs() >= self.config.crossing_epsilon
                || !self.grid.has_cooldown_elapsed(index, now, cooldown)
            {
                continue;
            }

            let Some(side) = crossing_direction(price, level_price, previous) else {
                debug!("Price {} near level {} without crossing it", price, level_price);
                continue;
            };

            info!("Price {} crossed grid level {} ({:?})", price, level_price, side);
            if let Err(e) = self
                .handle_crossing(index, side, price, now, &exits, &mut outcome)
                .await
            {
                error!(
                    "Crossing at level {} for {} failed ({:?}): {}",
                    level_price, self.config.symbol, side, e
                );
                outcome.errors.push(e);
            }

            self.grid.mark_crossed(index, now);
        }

        for (order_id, reason) in exits {
            match self.close_position(&order_id, reason).await {
                Ok(_) => outcome.closed.push((order_id, reason)),
                Err(e) => outcome.errors.push(e),
            }
        }

        outcome
    }

    async fn handle_crossing(
        &mut self,
        index: usize,
        side: PositionSide,
        price: f64,
        now: DateTime<Utc>,
        exits: &[(OrderId, CloseReason)],
        outcome: &mut TickOutcome,
    ) -> GridResult<()> {
        let level_price = self.level_price(index)?;

        if let Some(order_id) = self.opposing_position(index, side) {
            if exits.iter().any(|(id, _)| *id == order_id) {
                debug!(
                    "Position {} is due for exit, not reversing at level {}",
                    order_id, level_price
                );
                return Ok(());
            }

            let new_id = self.reverse_position(&order_id, side, index, price, now).await?;
            outcome.reversed.push(new_id);
            return Ok(());
        }

        let bound = self.grid.level(index).is_some_and(|l| l.is_bound());
        if !bound {
            let new_id = self.open_position(side, index, price, now).await?;
            outcome.opened.push(new_id);
        }

        Ok(())
    }

    /// Position facing the wrong way for a crossing of `index` in direction
    /// `side`: the one bound to the level itself, or when the level is empty,
    /// the one bound to the neighbour price came from.
    fn opposing_position(&self, index: usize, side: PositionSide) -> Option<OrderId> {
        let level = self.grid.level(index)?;

        let candidate = match &level.bound_position {
            Some(order_id) => order_id.clone(),
            None => {
                let (below, above) = self.grid.neighbors(index);
                match side {
                    PositionSide::Long => below.bound_position?,
                    PositionSide::Short => above.bound_position?,
                }
            }
        };

        let position = self.positions.get(&candidate)?;
        (position.side == side.opposite()).then_some(candidate)
    }

    fn collect_exits(&self, price: f64) -> Vec<(OrderId, CloseReason)> {
        let mut exits: Vec<(OrderId, CloseReason)> = self
            .positions
            .iter()
            .filter_map(|(id, p)| p.exit_trigger(price).map(|reason| (id.clone(), reason)))
            .collect();
        // stable order keeps logs and order flow reproducible
        exits.sort_by(|a, b| a.0.cmp(&b.0));
        exits
    }

    /// Open a market position at grid level `index`.
    ///
    /// Size is the base size scaled by the cover-loss multiplier, truncated to
    /// the quantity step. The stop is a percentage of entry; the target is a
    /// multiple of the grid step away.
    pub async fn open_position(
        &mut self,
        side: PositionSide,
        index: usize,
        price: f64,
        now: DateTime<Utc>,
    ) -> GridResult<OrderId> {
        let level_price = self.level_price(index)?;

        if self.positions.len() >= self.config.max_positions {
            warn!(
                "Not opening {:?} at level {}: {} positions open (max {})",
                side,
                level_price,
                self.positions.len(),
                self.config.max_positions
            );
            return Err(GridError::RiskLimitExceeded(format!(
                "max positions ({}) reached",
                self.config.max_positions
            )));
        }

        let size = self
            .config
            .round_qty(self.config.base_position_size * self.counters.current_size_multiplier);
        if size <= 0.0 {
            return Err(GridError::Configuration(format!(
                "position size rounds to zero at qty step {}",
                self.config.qty_step
            )));
        }

        let (stop_loss, take_profit) = self.exit_prices(side, price);
        let request = OrderRequest::market(&self.config.symbol, side.entry_side(), size)
            .with_brackets(Some(stop_loss), Some(take_profit));

        let ack = self.submit(&request).await.map_err(|e| {
            error!(
                "Failed to open {:?} {} size {} at level {}: {}",
                side, self.config.symbol, size, level_price, e
            );
            e
        })?;

        let mut position = Position {
            symbol: self.config.symbol.clone(),
            side,
            size,
            entry_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            exchange_order_id: ack.order_id.clone(),
            opened_at: now,
        };
        position.update_price(price);

        self.positions.insert(ack.order_id.clone(), position);
        self.grid.bind(index, ack.order_id.clone());

        info!(
            "Opened {:?} position at {}, size: {}, SL: {:.2}, TP: {:.2} (level {}, oid {})",
            side, price, size, stop_loss, take_profit, level_price, ack.order_id
        );

        Ok(ack.order_id)
    }

    /// Close `order_id` and immediately open `new_side` at level `index`.
    ///
    /// Two phases: the close must be acknowledged before any bookkeeping or
    /// the reopen happens. A failed close leaves the old position tracked. A
    /// failed reopen leaves the level empty.
    pub async fn reverse_position(
        &mut self,
        order_id: &str,
        new_side: PositionSide,
        index: usize,
        price: f64,
        now: DateTime<Utc>,
    ) -> GridResult<OrderId> {
        self.level_price(index)?;

        let (old_side, size, pnl) = {
            let position = self
                .positions
                .get(order_id)
                .ok_or_else(|| GridError::PositionNotFound(order_id.to_string()))?;
            (position.side, position.size, position.unrealized_pnl)
        };

        let request = OrderRequest::close(&self.config.symbol, old_side, size);
        if let Err(e) = self.submit(&request).await {
            error!(
                "Reversal aborted, failed to close {:?} {} size {} (oid {}): {}",
                old_side, self.config.symbol, size, order_id, e
            );
            return Err(e);
        }

        self.settle_close(order_id, pnl);
        info!(
            "Reversed position: {:?} -> {:?}, PnL: {:.4}, multiplier now {:.3}",
            old_side, new_side, pnl, self.counters.current_size_multiplier
        );

        self.open_position(new_side, index, price, now).await
    }

    /// Close a tracked position with a market order
    pub async fn close_position(&mut self, order_id: &str, reason: CloseReason) -> GridResult<f64> {
        let (side, size, pnl) = {
            let position = self
                .positions
                .get(order_id)
                .ok_or_else(|| GridError::PositionNotFound(order_id.to_string()))?;
            (position.side, position.size, position.unrealized_pnl)
        };

        let request = OrderRequest::close(&self.config.symbol, side, size);
        if let Err(e) = self.submit(&request).await {
            error!(
                "Failed to close {:?} {} size {} ({:?}, oid {}): {}",
                side, self.config.symbol, size, reason, order_id, e
            );
            return Err(e);
        }

        self.settle_close(order_id, pnl);
        info!("Closed position: {:?}, PnL: {:.4} (oid {})", reason, pnl, order_id);

        Ok(pnl)
    }

    /// Close every position and cancel resting orders. Attempts all closes
    /// even when some fail; the first failure is returned.
    pub async fn emergency_stop(&mut self) -> GridResult<usize> {
        warn!("EMERGENCY STOP - closing all {} positions", self.positions.len());

        let mut order_ids: Vec<OrderId> = self.positions.keys().cloned().collect();
        order_ids.sort();

        let mut closed = 0;
        let mut first_error = None;
        for order_id in order_ids {
            match self.close_position(&order_id, CloseReason::EmergencyStop).await {
                Ok(_) => closed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.exchange.cancel_all_orders(&self.config.symbol).await {
            error!("Failed to cancel orders during emergency stop: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Emergency stop completed: closed {} positions", closed);
                Ok(closed)
            }
        }
    }

    /// `false` when new opens should halt. Advisory only: the controller never
    /// stops itself.
    pub fn check_risk_limits(&self) -> bool {
        match self.risk_breach() {
            Some(breach) => {
                warn!("{}", breach);
                false
            }
            None => true,
        }
    }

    /// Description of the first breached risk limit, if any
    pub fn risk_breach(&self) -> Option<GridError> {
        if self.counters.daily_pnl < -self.config.max_daily_loss {
            return Some(GridError::RiskLimitExceeded(format!(
                "daily loss {:.2} exceeds limit {:.2}",
                self.counters.daily_pnl, self.config.max_daily_loss
            )));
        }

        self.positions
            .values()
            .find(|p| p.unrealized_pnl < -self.config.max_position_loss)
            .map(|p| {
                GridError::RiskLimitExceeded(format!(
                    "position {} loss {:.2} exceeds limit {:.2}",
                    p.exchange_order_id, p.unrealized_pnl, self.config.max_position_loss
                ))
            })
    }

    /// Enable or disable crossing checks on every level
    pub fn set_levels_active(&mut self, active: bool) {
        self.grid.set_all_active(active);
        info!(
            "Grid levels {} for {}",
            if active { "activated" } else { "deactivated" },
            self.config.symbol
        );
    }

    pub fn get_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            symbol: self.config.symbol.clone(),
            total_pnl: self.counters.total_pnl,
            daily_pnl: self.counters.daily_pnl,
            trade_count: self.counters.trade_count,
            active_positions: self.positions.len(),
            current_price: self.last_price,
            current_size_multiplier: self.counters.current_size_multiplier,
            consecutive_losses: self.counters.consecutive_losses,
            win_rate: self.counters.win_rate(),
            grid_level_count: self.grid.len(),
            last_price_update: self.last_update,
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position(&self, order_id: &str) -> Option<&Position> {
        self.positions.get(order_id)
    }

    pub fn grid(&self) -> &GridTable {
        &self.grid
    }

    pub fn counters(&self) -> &PerformanceCounters {
        &self.counters
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<E> {
        &self.exchange
    }

    fn level_price(&self, index: usize) -> GridResult<f64> {
        self.grid.level(index).map(|l| l.price).ok_or_else(|| {
            GridError::Configuration(format!(
                "grid level {} out of range ({} levels)",
                index,
                self.grid.len()
            ))
        })
    }

    fn exit_prices(&self, side: PositionSide, entry: f64) -> (f64, f64) {
        let step = self.grid.grid_step();
        let sl = self.config.stop_loss_pct;
        let tp = self.config.take_profit_step_multiplier;

        match side {
            PositionSide::Long => (entry * (1.0 - sl), entry + step * tp),
            PositionSide::Short => (entry * (1.0 + sl), entry - step * tp),
        }
    }

    /// Remove an acknowledged-closed position and account for it
    fn settle_close(&mut self, order_id: &str, pnl: f64) {
        if let Some(mut position) = self.positions.remove(order_id) {
            position.realized_pnl = pnl;
            self.grid.unbind_order(order_id);
            self.counters.record_close(pnl, &self.config.cover_loss);
            debug!(
                "Settled {:?} size {} entry {} realized {:.4}",
                position.side, position.size, position.entry_price, position.realized_pnl
            );
        }
    }

    async fn submit(&self, request: &OrderRequest) -> GridResult<OrderAck> {
        let timeout = Duration::from_millis(self.config.order_timeout_ms);
        match tokio::time::timeout(timeout, self.exchange.place_order(request)).await {
            Ok(result) => result,
            Err(_) => Err(GridError::Timeout(self.config.order_timeout_ms)),
        }
    }

    fn roll_trading_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if let Some(day) = self.trading_day {
            if day != today {
                info!(
                    "New trading day {}, resetting daily PnL ({:.2})",
                    today, self.counters.daily_pnl
                );
                self.counters.reset_daily();
            }
        }
        self.trading_day = Some(today);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::{ExchangePosition, OrderSide};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn test_config() -> GridConfig {
        GridConfig::new("BTCUSDT", vec![44000.0, 45000.0, 46000.0], 0.01)
    }

    fn create_test_controller(config: GridConfig) -> (GridController<MockExchange>, Arc<MockExchange>) {
        let exchange = Arc::new(MockExchange::new(45000.0));
        let controller = GridController::new(config, exchange.clone()).unwrap();
        (controller, exchange)
    }

    fn only_position(controller: &GridController<MockExchange>) -> Position {
        let positions: Vec<&Position> = controller.positions().collect();
        assert_eq!(positions.len(), 1);
        positions[0].clone()
    }

    #[test]
    fn test_crossing_direction() {
        assert_eq!(crossing_direction(100.05, 100.0, Some(99.95)), Some(PositionSide::Long));
        assert_eq!(crossing_direction(99.95, 100.0, Some(100.05)), Some(PositionSide::Short));
        // leaving the level counts as crossing it
        assert_eq!(crossing_direction(100.05, 100.0, Some(100.0)), Some(PositionSide::Long));
        assert_eq!(crossing_direction(99.95, 100.0, Some(100.0)), Some(PositionSide::Short));
        assert_eq!(crossing_direction(100.0, 100.0, Some(99.0)), Some(PositionSide::Long));
        assert_eq!(crossing_direction(100.0, 100.0, Some(101.0)), Some(PositionSide::Short));
        // staying on one side does not
        assert_eq!(crossing_direction(100.05, 100.0, Some(100.02)), None);
        assert_eq!(crossing_direction(99.95, 100.0, Some(99.0)), None);
        assert_eq!(crossing_direction(100.0, 100.0, Some(100.0)), None);
        assert_eq!(crossing_direction(100.05, 100.0, None), None);
        assert_eq!(crossing_direction(100.0, 100.0, None), None);
    }

    #[test]
    fn test_new_rejects_bad_grid() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let config = GridConfig::new("BTCUSDT", vec![45000.0], 0.01);
        let result = GridController::new(config, exchange);
        assert!(matches!(result, Err(GridError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_upward_cross_opens_long() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        let outcome = controller.update_price(46000.02, t(2)).await;

        assert_eq!(outcome.opened.len(), 1);
        assert!(outcome.is_clean());

        let position = only_position(&controller);
        assert_eq!(position.side, PositionSide::Long);
        assert!((position.size - 0.01).abs() < 1e-12);
        assert!((position.stop_loss.unwrap() - 46000.02 * 0.95).abs() < 1e-6);
        assert!((position.take_profit.unwrap() - (46000.02 + 950.0)).abs() < 1e-6);

        let level = controller.grid().level(2).unwrap();
        assert_eq!(level.bound_position.as_deref(), Some(position.exchange_order_id.as_str()));

        let orders = exchange.orders.lock().await;
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(!orders[0].reduce_only);
        assert!(orders[0].stop_loss.is_some() && orders[0].take_profit.is_some());
    }

    #[tokio::test]
    async fn test_exact_level_uses_approach_direction() {
        let (mut controller, _) = create_test_controller(test_config());

        controller.update_price(46500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;

        let position = only_position(&controller);
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.entry_price, 46000.0);
    }

    #[tokio::test]
    async fn test_exact_level_without_history_does_nothing() {
        let (mut controller, exchange) = create_test_controller(test_config());

        let outcome = controller.update_price(45000.0, t(0)).await;

        assert!(outcome.opened.is_empty());
        assert_eq!(exchange.order_count().await, 0);
        assert_eq!(controller.grid().level(1).unwrap().last_crossed_at, None);

        // moving off the level is a crossing, with no cooldown pending
        let at = t(0) + chrono::Duration::milliseconds(500);
        let outcome = controller.update_price(45000.05, at).await;
        assert_eq!(outcome.opened.len(), 1);
        assert_eq!(only_position(&controller).side, PositionSide::Long);
    }

    #[tokio::test]
    async fn test_crossing_from_just_below_opens_long() {
        let config = GridConfig::new("BTCUSDT", vec![45000.0, 46000.0], 0.01);
        let (mut controller, exchange) = create_test_controller(config);

        let outcome = controller.update_price(45999.95, t(0)).await;
        assert!(outcome.opened.is_empty());
        assert_eq!(exchange.order_count().await, 0);

        let outcome = controller.update_price(46000.02, t(2)).await;
        assert_eq!(outcome.opened.len(), 1);
        assert!(outcome.reversed.is_empty());

        let long = only_position(&controller);
        assert_eq!(long.side, PositionSide::Long);
        assert!((long.size - 0.01).abs() < 1e-12);
        assert_eq!(
            controller.grid().level(1).unwrap().bound_position.as_deref(),
            Some(long.exchange_order_id.as_str())
        );
        assert_eq!(exchange.order_count().await, 1);
        assert_eq!(controller.counters().trade_count, 0);
        assert_eq!(controller.counters().current_size_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_near_level_on_same_side_is_not_a_crossing() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(46000.5, t(0)).await;
        let outcome = controller.update_price(46000.05, t(2)).await;

        assert!(outcome.opened.is_empty());
        assert_eq!(exchange.order_count().await, 0);
        assert_eq!(controller.grid().level(2).unwrap().last_crossed_at, None);
    }

    #[tokio::test]
    async fn test_repeated_tick_is_idempotent() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.05, t(2)).await;
        assert_eq!(exchange.order_count().await, 1);

        let outcome = controller.update_price(46000.05, t(2)).await;
        assert!(outcome.opened.is_empty() && outcome.reversed.is_empty());
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_oscillation() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.05, t(10)).await;
        assert_eq!(exchange.order_count().await, 1);

        // back below the level within the cooldown window
        let at = t(10) + chrono::Duration::milliseconds(500);
        controller.update_price(45999.95, at).await;
        assert_eq!(exchange.order_count().await, 1);
        assert_eq!(only_position(&controller).side, PositionSide::Long);

        // a suppressed crossing is not replayed once the cooldown passes
        controller.update_price(45999.95, t(12)).await;
        assert_eq!(exchange.order_count().await, 1);

        // a fresh crossing after the cooldown reverses
        controller.update_price(46000.05, t(13)).await;
        assert_eq!(exchange.order_count().await, 1);
        controller.update_price(45999.95, t(15)).await;
        assert_eq!(only_position(&controller).side, PositionSide::Short);
        assert_eq!(exchange.order_count().await, 3);
    }

    #[tokio::test]
    async fn test_end_to_end_reversal_scenario() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45000.0, t(0)).await;
        assert_eq!(exchange.order_count().await, 0);

        let outcome = controller.update_price(46000.0, t(2)).await;
        assert_eq!(outcome.opened.len(), 1);
        let long = only_position(&controller);
        assert_eq!(long.side, PositionSide::Long);
        assert!((long.size - 0.01).abs() < 1e-12);
        assert_eq!(long.entry_price, 46000.0);

        let outcome = controller.update_price(45000.0, t(4)).await;
        assert_eq!(outcome.reversed.len(), 1);
        assert!(outcome.is_clean());

        let short = only_position(&controller);
        assert_eq!(short.side, PositionSide::Short);
        assert!((short.size - 0.015).abs() < 1e-12);
        assert_eq!(short.entry_price, 45000.0);

        let counters = controller.counters();
        assert_eq!(counters.consecutive_losses, 1);
        assert!((counters.current_size_multiplier - 1.5).abs() < 1e-12);
        assert!((counters.total_pnl - -10.0).abs() < 1e-9);
        assert_eq!(counters.trade_count, 1);

        // binding moved from 46000 to 45000
        assert!(!controller.grid().level(2).unwrap().is_bound());
        assert_eq!(
            controller.grid().level(1).unwrap().bound_position.as_deref(),
            Some(short.exchange_order_id.as_str())
        );

        let orders = exchange.orders.lock().await;
        assert_eq!(orders.len(), 3);
        assert!(orders[1].reduce_only);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert!((orders[1].qty - 0.01).abs() < 1e-12);
        assert_eq!(orders[2].side, OrderSide::Sell);
        assert!(!orders[2].reduce_only);
    }

    #[tokio::test]
    async fn test_reversal_keeps_position_when_close_fails() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45000.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        let long = only_position(&controller);

        exchange.set_fail_closes(true).await;
        let outcome = controller.update_price(45000.0, t(4)).await;

        assert!(outcome.reversed.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].is_exchange_failure());

        let still_there = only_position(&controller);
        assert_eq!(still_there.exchange_order_id, long.exchange_order_id);
        assert_eq!(still_there.side, PositionSide::Long);
        assert!(controller.grid().level(2).unwrap().is_bound());
        assert!(!controller.grid().level(1).unwrap().is_bound());

        let counters = controller.counters();
        assert_eq!(counters.trade_count, 0);
        assert_eq!(counters.consecutive_losses, 0);
        assert_eq!(counters.current_size_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_reversal_reopen_failure_leaves_level_empty() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45000.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;

        exchange.set_fail_opens(true).await;
        let outcome = controller.update_price(45000.0, t(4)).await;

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(controller.positions().count(), 0);
        assert!(controller.grid().iter().all(|l| !l.is_bound()));
        assert_eq!(controller.counters().trade_count, 1);
        assert_eq!(controller.counters().consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_stop_loss_closes_and_unbinds() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;

        let outcome = controller.update_price(43600.0, t(4)).await;

        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].1, CloseReason::StopLoss);
        assert_eq!(controller.positions().count(), 0);
        assert!(controller.grid().iter().all(|l| !l.is_bound()));

        let counters = controller.counters();
        assert!((counters.total_pnl - -24.0).abs() < 1e-9);
        assert!((counters.daily_pnl - -24.0).abs() < 1e-9);
        assert_eq!(counters.trade_count, 1);
        assert_eq!(counters.consecutive_losses, 1);

        let orders = exchange.orders.lock().await;
        assert!(orders.last().unwrap().reduce_only);
    }

    #[tokio::test]
    async fn test_take_profit_decays_multiplier() {
        let (mut controller, _) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        let outcome = controller.update_price(47000.0, t(4)).await;

        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].1, CloseReason::TakeProfit);
        let counters = controller.counters();
        assert!((counters.total_pnl - 10.0).abs() < 1e-9);
        assert_eq!(counters.consecutive_losses, 0);
        assert_eq!(counters.current_size_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_failed_close_retains_position() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;

        exchange.set_fail_closes(true).await;
        let outcome = controller.update_price(43000.0, t(4)).await;
        assert!(outcome.closed.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(controller.positions().count(), 1);

        // next tick retries
        exchange.set_fail_closes(false).await;
        let outcome = controller.update_price(43000.0, t(5)).await;
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(controller.positions().count(), 0);
    }

    #[tokio::test]
    async fn test_exit_takes_priority_over_reversal() {
        let config = test_config().with_exits(0.02, 0.95);
        let (mut controller, exchange) = create_test_controller(config);

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(45000.0, t(2)).await;
        let short = only_position(&controller);
        assert_eq!(short.side, PositionSide::Short);
        assert!((short.stop_loss.unwrap() - 45900.0).abs() < 1e-6);

        // crosses 46000 upward while the short is through its stop
        let outcome = controller.update_price(46000.05, t(4)).await;

        assert!(outcome.reversed.is_empty());
        assert!(outcome.opened.is_empty());
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].1, CloseReason::StopLoss);
        assert_eq!(controller.positions().count(), 0);
        assert_eq!(exchange.order_count().await, 2);
    }

    #[tokio::test]
    async fn test_max_positions_blocks_open() {
        let config = test_config().with_max_positions(1);
        let (mut controller, exchange) = create_test_controller(config);

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        controller.update_price(44500.0, t(4)).await;
        let outcome = controller.update_price(44000.0, t(6)).await;

        assert!(outcome.opened.is_empty());
        assert!(matches!(outcome.errors[0], GridError::RiskLimitExceeded(_)));
        assert_eq!(outcome.exchange_failures(), 0);
        assert_eq!(controller.positions().count(), 1);
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_inactive_levels_are_skipped() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.set_levels_active(false);
        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        assert_eq!(exchange.order_count().await, 0);

        controller.set_levels_active(true);
        controller.update_price(46000.05, t(4)).await;
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_order_timeout_treated_as_failure() {
        let config = test_config().with_order_timeout(20);
        let (mut controller, exchange) = create_test_controller(config);
        exchange.set_order_delay_ms(200).await;

        controller.update_price(45500.0, t(0)).await;
        let outcome = controller.update_price(46000.0, t(2)).await;

        assert_eq!(outcome.errors, vec![GridError::Timeout(20)]);
        assert_eq!(controller.positions().count(), 0);
        assert!(controller.grid().iter().all(|l| !l.is_bound()));
    }

    #[tokio::test]
    async fn test_risk_limits() {
        let config = test_config().with_risk_limits(100.0, 5.0);
        let (mut controller, _) = create_test_controller(config);
        assert!(controller.check_risk_limits());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        controller.update_price(45600.0, t(4)).await;
        assert!(controller.check_risk_limits());

        controller.update_price(45400.0, t(6)).await;
        assert!(!controller.check_risk_limits());
        assert!(matches!(controller.risk_breach(), Some(GridError::RiskLimitExceeded(_))));
    }

    #[tokio::test]
    async fn test_daily_loss_limit_and_rollover() {
        let config = test_config().with_risk_limits(20.0, 50.0);
        let (mut controller, _) = create_test_controller(config);

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        controller.update_price(43600.0, t(4)).await;
        assert!(!controller.check_risk_limits());

        let next_day = t(24 * 3600);
        controller.update_price(43600.0, next_day).await;
        assert_eq!(controller.counters().daily_pnl, 0.0);
        assert!((controller.counters().total_pnl - -24.0).abs() < 1e-9);
        assert!(controller.check_risk_limits());
    }

    #[tokio::test]
    async fn test_initialize_adopts_positions() {
        let (mut controller, exchange) = create_test_controller(test_config());
        *exchange.positions.lock().await = vec![
            ExchangePosition {
                side: PositionSide::Long,
                size: 0.02,
                entry_price: 45000.5,
                unrealized_pnl: 1.0,
                stop_loss: Some(42750.0),
                take_profit: None,
            },
            ExchangePosition {
                side: PositionSide::Short,
                size: 0.01,
                entry_price: 45500.0,
                unrealized_pnl: -2.0,
                stop_loss: None,
                take_profit: None,
            },
        ];

        controller.initialize().await.unwrap();

        assert_eq!(*exchange.leverage_calls.lock().await, vec![10]);
        assert_eq!(*exchange.cancel_all_calls.lock().await, 1);
        assert_eq!(controller.positions().count(), 2);
        assert_eq!(
            controller.grid().level(1).unwrap().bound_position.as_deref(),
            Some("adopted-1")
        );
        assert_eq!(controller.grid().iter().filter(|l| l.is_bound()).count(), 1);

        // marked so that PnL agrees with price before the first tick
        let long = controller.position("adopted-1").unwrap();
        assert!((long.current_price - 45050.5).abs() < 1e-6);
        assert!((long.unrealized_pnl - 1.0).abs() < 1e-9);
        let short = controller.position("adopted-2").unwrap();
        assert!((short.current_price - 45700.0).abs() < 1e-6);
        assert!((short.unrealized_pnl - -2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_position_size_follows_qty_step() {
        let config = GridConfig::new("BTCUSDT", vec![45000.0, 46000.0], 0.01).with_max_positions(1);
        let (mut controller, exchange) = create_test_controller(config);

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.05, t(2)).await;
        // two losing reversals: multiplier 1.5 then 2.25
        controller.update_price(45999.95, t(4)).await;
        controller.update_price(46000.05, t(6)).await;
        let long = only_position(&controller);
        assert_eq!(long.size, 0.022);

        // take profit: multiplier decays to 2.025
        let outcome = controller.update_price(47000.0, t(8)).await;
        assert_eq!(outcome.closed[0].1, CloseReason::TakeProfit);
        assert!((controller.counters().current_size_multiplier - 2.025).abs() < 1e-12);

        controller.update_price(45999.95, t(10)).await;
        let short = only_position(&controller);
        assert_eq!(short.side, PositionSide::Short);
        assert_eq!(short.size, 0.02);

        let orders = exchange.orders.lock().await;
        let qtys: Vec<f64> = orders.iter().map(|o| o.qty).collect();
        assert_eq!(qtys, vec![0.01, 0.01, 0.015, 0.015, 0.022, 0.022, 0.02]);
        assert_eq!(format!("{:.3}", orders[6].qty), "0.020");
        assert_eq!(orders[6].qty, short.size);
    }

    #[tokio::test]
    async fn test_out_of_range_level_rejected() {
        let (mut controller, exchange) = create_test_controller(test_config());

        let result = controller.open_position(PositionSide::Long, 3, 46000.0, t(0)).await;
        assert!(matches!(result, Err(GridError::Configuration(_))));
        assert_eq!(exchange.order_count().await, 0);
        assert_eq!(controller.positions().count(), 0);

        let order_id = controller
            .open_position(PositionSide::Long, 2, 46000.0, t(0))
            .await
            .unwrap();
        let result = controller
            .reverse_position(&order_id, PositionSide::Short, 7, 45000.0, t(2))
            .await;
        assert!(matches!(result, Err(GridError::Configuration(_))));
        assert_eq!(exchange.order_count().await, 1);
        assert!(controller.position(&order_id).is_some());
        assert!(controller.grid().level(2).unwrap().is_bound());
    }

    #[tokio::test]
    async fn test_emergency_stop_closes_everything() {
        let (mut controller, exchange) = create_test_controller(test_config());

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;
        controller.update_price(44500.0, t(4)).await;
        controller.update_price(44000.0, t(6)).await;
        assert_eq!(controller.positions().count(), 2);

        let closed = controller.emergency_stop().await.unwrap();

        assert_eq!(closed, 2);
        assert_eq!(controller.positions().count(), 0);
        assert!(controller.grid().iter().all(|l| !l.is_bound()));
        assert_eq!(*exchange.cancel_all_calls.lock().await, 1);
        assert_eq!(controller.counters().trade_count, 2);
    }

    #[tokio::test]
    async fn test_get_status() {
        let (mut controller, _) = create_test_controller(test_config());

        let status = controller.get_status();
        assert_eq!(status.grid_level_count, 3);
        assert_eq!(status.current_price, None);
        assert_eq!(status.current_size_multiplier, 1.0);

        controller.update_price(45500.0, t(0)).await;
        controller.update_price(46000.0, t(2)).await;

        let status = controller.get_status();
        assert_eq!(status.symbol, "BTCUSDT");
        assert_eq!(status.active_positions, 1);
        assert_eq!(status.current_price, Some(46000.0));
        assert_eq!(status.last_price_update, Some(t(2)));
        assert_eq!(status.trade_count, 0);
        assert_eq!(status.win_rate, 0.0);

        controller.update_price(47000.0, t(4)).await;
        let status = controller.get_status();
        assert_eq!(status.trade_count, 1);
        assert_eq!(status.win_rate, 100.0);
    }
}
