//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{OrderBookMetrics, OrderBookState, PriceLevel, Side};
use crate::error::{FeedError, Result};
use crate::protocol::BookLevels;

/// Mirrored order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, PriceLevel>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, PriceLevel>,
    /// Seqnum of the last applied snapshot or update
    seqnum: u64,
    /// Whether the book has been initialized with a snapshot
    initialized: bool,
    /// Set after a sequence gap; cleared by the next snapshot
    stale: bool,
    /// Decimal places prices are rounded to, from the symbol's price increment
    price_scale: Option<u32>,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            seqnum: 0,
            initialized: false,
            stale: false,
            price_scale: None,
        }
    }

    pub fn with_price_scale(symbol: &str, price_scale: Option<u32>) -> Self {
        let mut book = Self::new(symbol);
        book.price_scale = price_scale;
        book
    }

    /// Replace both sides with a snapshot
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], seqnum: u64) {
        self.bids.clear();
        self.asks.clear();

        for level in bids.iter().filter(|l| l.quantity > Decimal::ZERO) {
            let level = self.normalize(level);
            self.bids.insert(Reverse(level.price), level);
        }

        for level in asks.iter().filter(|l| l.quantity > Decimal::ZERO) {
            let level = self.normalize(level);
            self.asks.insert(level.price, level);
        }

        self.seqnum = seqnum;
        self.initialized = true;
        self.stale = false;
    }

    /// Apply a single level delta
    ///
    /// Quantity zero removes the level; removing an absent level is a no-op.
    pub fn apply_update(&mut self, side: Side, level: &PriceLevel, seqnum: u64) -> Result<()> {
        self.ensure_baseline()?;
        self.update_side(side, level);
        self.seqnum = seqnum;
        Ok(())
    }

    /// Apply every level of an update message
    pub fn apply_levels(&mut self, levels: &BookLevels, seqnum: u64) -> Result<()> {
        self.ensure_baseline()?;
        for level in &levels.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &levels.asks {
            self.update_side(Side::Ask, level);
        }
        self.seqnum = seqnum;
        Ok(())
    }

    fn ensure_baseline(&self) -> Result<()> {
        if !self.initialized || self.stale {
            return Err(FeedError::NoBaseline(self.symbol.clone()));
        }
        Ok(())
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        let level = self.normalize(level);
        match side {
            Side::Bid => {
                if level.quantity.is_zero() {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level);
                }
            }
            Side::Ask => {
                if level.quantity.is_zero() {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level);
                }
            }
        }
    }

    /// Canonical price key: rounded to the tick scale, trailing zeros dropped
    fn normalize(&self, level: &PriceLevel) -> PriceLevel {
        let price = match self.price_scale {
            Some(scale) => level.price.round_dp(scale),
            None => level.price,
        };
        PriceLevel {
            price: price.normalize(),
            quantity: level.quantity,
            order_count: level.order_count,
        }
    }

    /// Mark the book untrusted until the next snapshot
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Check if the book is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Best level on one side
    pub fn best(&self, side: Side) -> Option<PriceLevel> {
        match side {
            Side::Bid => self.bids.first_key_value().map(|(_, l)| l.clone()),
            Side::Ask => self.asks.first_key_value().map(|(_, l)| l.clone()),
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Top `n` levels of one side, best first
    pub fn depth(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        match side {
            Side::Bid => self.bids.values().take(n).cloned().collect(),
            Side::Ask => self.asks.values().take(n).cloned().collect(),
        }
    }

    pub fn level_count(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.values().take(levels).map(|l| l.quantity).sum();
        let ask_volume: Decimal = self.asks.values().take(levels).map(|l| l.quantity).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Snapshot of the top `levels` on each side, with metrics
    pub fn state(&self, levels: usize) -> OrderBookState {
        OrderBookState {
            symbol: self.symbol.clone(),
            seqnum: self.seqnum,
            stale: self.stale,
            bids: self.depth(Side::Bid, levels),
            asks: self.depth(Side::Ask, levels),
            metrics: self.calculate_metrics(levels),
        }
    }

    /// Calculate order book metrics
    fn calculate_metrics(&self, levels: usize) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(levels),
            bid_depth: self.bids.values().map(|l| l.quantity).sum(),
            ask_depth: self.asks.values().map(|l| l.quantity).sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
        PriceLevel::new(price, quantity, 1)
    }

    fn create_test_book() -> OrderBook {
        let mut book = OrderBook::new("BTC-USD");
        book.apply_snapshot(
            &[level(dec!(50000), dec!(1.0)), level(dec!(49999), dec!(2.0))],
            &[level(dec!(50001), dec!(1.5)), level(dec!(50002), dec!(2.5))],
            100,
        );
        book
    }

    #[test]
    fn test_best_bid_ask() {
        let book = create_test_book();
        assert_eq!(book.best_bid(), Some(dec!(50000)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
        assert_eq!(book.best(Side::Ask).unwrap().quantity, dec!(1.5));
    }

    #[test]
    fn test_mid_price() {
        let book = create_test_book();
        assert_eq!(book.mid_price(), Some(dec!(50000.5)));
    }

    #[test]
    fn test_imbalance() {
        let book = create_test_book();
        // Bids: 1.0 + 2.0 = 3.0, Asks: 1.5 + 2.5 = 4.0
        let imbalance = book.imbalance(10).unwrap();
        assert!(imbalance < Decimal::ZERO);
    }

    #[test]
    fn test_update_requires_snapshot() {
        let mut book = OrderBook::new("BTC-USD");
        let result = book.apply_update(Side::Bid, &level(dec!(100), dec!(1)), 1);
        assert!(matches!(result, Err(FeedError::NoBaseline(_))));
        assert_eq!(book.level_count(Side::Bid), 0);
    }

    #[test]
    fn test_zero_quantity_removes_and_readd_restores() {
        let mut book = create_test_book();
        book.apply_update(Side::Bid, &level(dec!(50000), Decimal::ZERO), 101)
            .unwrap();
        assert!(book
            .depth(Side::Bid, 10)
            .iter()
            .all(|l| l.price != dec!(50000)));
        assert_eq!(book.best_bid(), Some(dec!(49999)));

        book.apply_update(Side::Bid, &level(dec!(50000), dec!(0.7)), 102)
            .unwrap();
        assert_eq!(book.best(Side::Bid).unwrap().quantity, dec!(0.7));
        assert_eq!(book.seqnum(), 102);
    }

    #[test]
    fn test_removing_absent_level_is_noop() {
        let mut book = create_test_book();
        book.apply_update(Side::Ask, &level(dec!(60000), Decimal::ZERO), 101)
            .unwrap();
        assert_eq!(book.level_count(Side::Ask), 2);
    }

    #[test]
    fn test_equal_prices_share_a_key() {
        let mut book = create_test_book();
        book.apply_update(Side::Ask, &level(dec!(50003.0), dec!(1)), 101)
            .unwrap();
        book.apply_update(Side::Ask, &level(dec!(50003.00), dec!(4)), 102)
            .unwrap();
        assert_eq!(book.level_count(Side::Ask), 3);
        assert_eq!(book.depth(Side::Ask, 3)[2].quantity, dec!(4));
    }

    #[test]
    fn test_price_scale_rounds_keys() {
        let mut book = OrderBook::with_price_scale("BTC-USD", Some(1));
        book.apply_snapshot(&[level(dec!(100.04), dec!(1))], &[], 1);
        book.apply_update(Side::Bid, &level(dec!(100.0), dec!(3)), 2)
            .unwrap();
        assert_eq!(book.level_count(Side::Bid), 1);
        assert_eq!(book.best(Side::Bid).unwrap().quantity, dec!(3));
    }

    #[test]
    fn test_depth_ordering() {
        let book = create_test_book();
        let bids = book.depth(Side::Bid, 5);
        let asks = book.depth(Side::Ask, 1);
        assert_eq!(bids.len(), 2);
        assert!(bids[0].price > bids[1].price);
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].price, dec!(50001));
    }

    #[test]
    fn test_snapshot_replaces_and_skips_empty_levels() {
        let mut book = create_test_book();
        book.apply_snapshot(
            &[level(dec!(10), dec!(1)), level(dec!(9), Decimal::ZERO)],
            &[],
            200,
        );
        assert_eq!(book.level_count(Side::Bid), 1);
        assert_eq!(book.level_count(Side::Ask), 0);
        assert_eq!(book.seqnum(), 200);
    }

    #[test]
    fn test_stale_book_rejects_updates_until_snapshot() {
        let mut book = create_test_book();
        book.mark_stale();
        assert!(book
            .apply_update(Side::Bid, &level(dec!(1), dec!(1)), 101)
            .is_err());

        book.apply_snapshot(&[level(dec!(1), dec!(1))], &[], 150);
        assert!(!book.is_stale());
        assert!(book
            .apply_update(Side::Bid, &level(dec!(2), dec!(1)), 151)
            .is_ok());
    }

    #[test]
    fn test_apply_levels() {
        let mut book = create_test_book();
        let update = BookLevels {
            bids: vec![level(dec!(50000), dec!(2.0))],
            asks: vec![level(dec!(50001), Decimal::ZERO)],
        };

        book.apply_levels(&update, 102).unwrap();
        assert_eq!(book.seqnum(), 102);
        assert_eq!(book.best(Side::Bid).unwrap().quantity, dec!(2.0));
        assert_eq!(book.best_ask(), Some(dec!(50002)));
        assert!(book.state(5).metrics.is_healthy());
    }
}
