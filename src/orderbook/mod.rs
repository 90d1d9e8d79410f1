//! Order book module
//!
//! Mirrors exchange order books from l2/l3 snapshots and deltas.

mod book;
mod manager;
mod metrics;

pub use book::OrderBook;
pub use manager::BookManager;
pub use metrics::OrderBookMetrics;

pub use crate::protocol::PriceLevel;

use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => f.write_str("bid"),
            Side::Ask => f.write_str("ask"),
        }
    }
}

/// Order book state to be published
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub seqnum: u64,
    pub stale: bool,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub metrics: OrderBookMetrics,
}
