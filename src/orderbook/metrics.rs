//! Order book metrics calculation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics for an order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Simple imbalance: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Total bid depth (volume)
    pub bid_depth: Decimal,

    /// Total ask depth (volume)
    pub ask_depth: Decimal,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Two-sided book with a valid spread
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some()
            && self.spread_bps.is_some()
            && self.bid_levels > 0
            && self.ask_levels > 0
    }

    /// Crossed or locked books mean the mirror is out of sync
    pub fn is_crossed(&self) -> bool {
        matches!(self.spread_bps, Some(spread) if spread <= Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_metrics_unhealthy() {
        let metrics = OrderBookMetrics::default();
        assert!(!metrics.is_healthy());
        assert!(!metrics.is_crossed());
    }

    #[test]
    fn test_crossed_detection() {
        let metrics = OrderBookMetrics {
            mid_price: Some(dec!(100)),
            spread_bps: Some(dec!(-10)),
            bid_levels: 1,
            ask_levels: 1,
            ..Default::default()
        };
        assert!(metrics.is_healthy());
        assert!(metrics.is_crossed());
    }
}
