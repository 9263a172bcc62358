//! Fixed set of price levels and their position bindings

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::OrderId;

/// Individual grid level tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Price at this level, fixed after construction
    pub price: f64,
    /// Order id of the open position bound to this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_position: Option<OrderId>,
    /// Last time price was seen crossing this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_crossed_at: Option<DateTime<Utc>>,
    /// Whether this level takes part in crossing checks
    pub active: bool,
}

impl GridLevel {
    /// Create a new, active, unbound grid level
    pub fn new(price: f64) -> Self {
        Self {
            price,
            bound_position: None,
            last_crossed_at: None,
            active: true,
        }
    }

    /// Level outside the table, used at the array boundaries
    fn synthetic(price: f64) -> Self {
        Self {
            active: false,
            ..Self::new(price)
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_position.is_some()
    }
}

/// Ordered, deduplicated price levels. The number of levels never changes
/// after `build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTable {
    levels: Vec<GridLevel>,
}

impl GridTable {
    /// Sort and deduplicate `prices` into a table of at least two levels
    pub fn build(prices: &[f64]) -> GridResult<Self> {
        if let Some(bad) = prices.iter().find(|p| !p.is_finite() || **p <= 0.0) {
            return Err(GridError::Configuration(format!(
                "grid level must be a positive finite price, got {}",
                bad
            )));
        }

        let mut sorted = prices.to_vec();
        sorted.sort_by(f64::total_cmp);
        sorted.dedup();

        if sorted.len() < 2 {
            return Err(GridError::Configuration(format!(
                "grid needs at least 2 distinct levels, got {}",
                sorted.len()
            )));
        }

        Ok(Self {
            levels: sorted.into_iter().map(GridLevel::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter()
    }

    pub fn level(&self, index: usize) -> Option<&GridLevel> {
        self.levels.get(index)
    }

    /// Spacing between the two smallest levels
    pub fn grid_step(&self) -> f64 {
        self.levels[1].price - self.levels[0].price
    }

    /// Index of the level closest to `price`; ties go to the lower level
    pub fn nearest_index(&self, price: f64) -> usize {
        let mut best = 0;
        let mut best_dist = (self.levels[0].price - price).abs();
        for (i, level) in self.levels.iter().enumerate().skip(1) {
            let dist = (level.price - price).abs();
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        best
    }

    /// Level closest to `price`; ties go to the lower level
    pub fn find_nearest(&self, price: f64) -> &GridLevel {
        &self.levels[self.nearest_index(price)]
    }

    /// Levels directly below and above `index`. At either end of the table a
    /// synthetic, inactive level one grid step further out is returned.
    pub fn neighbors(&self, index: usize) -> (GridLevel, GridLevel) {
        let step = self.grid_step();
        let price = self.levels[index].price;

        let prev = match index.checked_sub(1) {
            Some(i) => self.levels[i].clone(),
            None => GridLevel::synthetic(price - step),
        };
        let next = match self.levels.get(index + 1) {
            Some(level) => level.clone(),
            None => GridLevel::synthetic(price + step),
        };
        (prev, next)
    }

    pub fn mark_crossed(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(level) = self.levels.get_mut(index) {
            level.last_crossed_at = Some(at);
        }
    }

    /// `at - last_crossed_at >= cooldown`. A level that was never crossed is
    /// always ready.
    pub fn has_cooldown_elapsed(&self, index: usize, at: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.levels.get(index).and_then(|l| l.last_crossed_at) {
            Some(last) => at - last >= cooldown,
            None => true,
        }
    }

    pub fn bind(&mut self, index: usize, order_id: OrderId) {
        if let Some(level) = self.levels.get_mut(index) {
            level.bound_position = Some(order_id);
        }
    }

    /// Clear the binding that references `order_id`, returning the level index
    pub fn unbind_order(&mut self, order_id: &str) -> Option<usize> {
        let index = self.index_of_order(order_id)?;
        self.levels[index].bound_position = None;
        Some(index)
    }

    pub fn index_of_order(&self, order_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.bound_position.as_deref() == Some(order_id))
    }

    pub fn set_active(&mut self, index: usize, active: bool) {
        if let Some(level) = self.levels.get_mut(index) {
            level.active = active;
        }
    }

    pub fn set_all_active(&mut self, active: bool) {
        for level in &mut self.levels {
            level.active = active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sorts_and_dedups() {
        let table = GridTable::build(&[46000.0, 44000.0, 45000.0, 44000.0]).unwrap();
        let prices: Vec<f64> = table.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![44000.0, 45000.0, 46000.0]);
        assert!(table.iter().all(|l| l.active && !l.is_bound()));
    }

    #[test]
    fn test_build_rejects_degenerate_input() {
        assert!(matches!(GridTable::build(&[]), Err(GridError::Configuration(_))));
        assert!(matches!(
            GridTable::build(&[100.0, 100.0]),
            Err(GridError::Configuration(_))
        ));
        assert!(GridTable::build(&[100.0, f64::NAN]).is_err());
        assert!(GridTable::build(&[-1.0, 100.0]).is_err());
    }

    #[test]
    fn test_find_nearest_tie_goes_low() {
        let table = GridTable::build(&[100.0, 200.0]).unwrap();
        assert_eq!(table.find_nearest(150.0).price, 100.0);
        assert_eq!(table.find_nearest(151.0).price, 200.0);
        assert_eq!(table.find_nearest(10.0).price, 100.0);
        assert_eq!(table.find_nearest(1e6).price, 200.0);
    }

    #[test]
    fn test_neighbors_synthesize_at_edges() {
        let table = GridTable::build(&[44000.0, 45000.0, 46000.0]).unwrap();

        let (prev, next) = table.neighbors(1);
        assert_eq!(prev.price, 44000.0);
        assert_eq!(next.price, 46000.0);

        let (prev, next) = table.neighbors(0);
        assert_eq!(prev.price, 43000.0);
        assert!(!prev.active);
        assert_eq!(next.price, 45000.0);

        let (_, next) = table.neighbors(2);
        assert_eq!(next.price, 47000.0);
    }

    #[test]
    fn test_cooldown() {
        let mut table = GridTable::build(&[100.0, 200.0]).unwrap();
        let t0 = Utc::now();
        let cooldown = Duration::seconds(1);

        assert!(table.has_cooldown_elapsed(0, t0, cooldown));
        table.mark_crossed(0, t0);
        assert!(!table.has_cooldown_elapsed(0, t0, cooldown));
        assert!(!table.has_cooldown_elapsed(0, t0 + Duration::milliseconds(999), cooldown));
        assert!(table.has_cooldown_elapsed(0, t0 + Duration::seconds(1), cooldown));
        // other levels are unaffected
        assert!(table.has_cooldown_elapsed(1, t0, cooldown));
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut table = GridTable::build(&[100.0, 200.0, 300.0]).unwrap();
        table.bind(1, "abc".into());
        assert_eq!(table.index_of_order("abc"), Some(1));
        assert_eq!(table.unbind_order("abc"), Some(1));
        assert_eq!(table.unbind_order("abc"), None);
        assert!(!table.level(1).unwrap().is_bound());
    }
}
