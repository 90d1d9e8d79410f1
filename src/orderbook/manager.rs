//! Order book manager
//!
//! Owns one book per l2/l3 channel identity. Books are created on the first
//! snapshot and dropped when their subscription ends.

use std::collections::HashMap;

use super::{OrderBook, OrderBookState, PriceLevel, Side};
use crate::error::{FeedError, Result};
use crate::protocol::{BookLevels, Channel, ChannelId};

/// Manages order books for multiple symbols
#[derive(Debug, Default)]
pub struct BookManager {
    books: HashMap<ChannelId, OrderBook>,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
        }
    }

    /// Replace (or create) the book for `id` from a snapshot
    pub fn apply_snapshot(
        &mut self,
        id: &ChannelId,
        levels: &BookLevels,
        seqnum: u64,
        price_scale: Option<u32>,
    ) -> &OrderBook {
        let symbol = id.symbol.as_deref().unwrap_or_default();
        let book = self
            .books
            .entry(id.clone())
            .or_insert_with(|| OrderBook::with_price_scale(symbol, price_scale));
        book.apply_snapshot(&levels.bids, &levels.asks, seqnum);
        &*book
    }

    /// Apply a delta to an existing book
    pub fn apply_update(&mut self, id: &ChannelId, levels: &BookLevels, seqnum: u64) -> Result<&OrderBook> {
        let book = self
            .books
            .get_mut(id)
            .ok_or_else(|| FeedError::NoBaseline(id.to_string()))?;
        book.apply_levels(levels, seqnum)?;
        Ok(&*book)
    }

    /// Mark a book stale after a sequence gap
    pub fn mark_stale(&mut self, id: &ChannelId) -> bool {
        match self.books.get_mut(id) {
            Some(book) => {
                book.mark_stale();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &ChannelId) -> Option<OrderBook> {
        self.books.remove(id)
    }

    pub fn clear(&mut self) {
        self.books.clear();
    }

    pub fn get(&self, id: &ChannelId) -> Option<&OrderBook> {
        self.books.get(id)
    }

    /// Book for a symbol, preferring the aggregated l2 view over l3
    pub fn book_for_symbol(&self, symbol: &str) -> Option<&OrderBook> {
        [Channel::L2, Channel::L3]
            .into_iter()
            .find_map(|channel| self.books.get(&ChannelId::symbol_scoped(channel, symbol)))
    }

    /// First book for a symbol whose levels are current
    ///
    /// A stale book keeps its pre-gap levels until the next snapshot, so
    /// price queries skip it.
    fn live_book_for_symbol(&self, symbol: &str) -> Option<&OrderBook> {
        [Channel::L2, Channel::L3]
            .into_iter()
            .filter_map(|channel| self.books.get(&ChannelId::symbol_scoped(channel, symbol)))
            .find(|book| !book.is_stale())
    }

    pub fn best(&self, symbol: &str, side: Side) -> Option<PriceLevel> {
        self.live_book_for_symbol(symbol).and_then(|book| book.best(side))
    }

    pub fn depth(&self, symbol: &str, side: Side, n: usize) -> Vec<PriceLevel> {
        self.live_book_for_symbol(symbol)
            .map(|book| book.depth(side, n))
            .unwrap_or_default()
    }

    /// Get the state of a specific book, stale or not
    pub fn get_state(&self, symbol: &str, levels: usize) -> Option<OrderBookState> {
        self.book_for_symbol(symbol).map(|book| book.state(levels))
    }

    /// Get list of symbols being tracked
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .books
            .keys()
            .filter_map(|id| id.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
