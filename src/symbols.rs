//! Symbol reference data
//!
//! Filled from the symbols channel. The only thing the rest of the feed needs
//! from it today is the price scale used to normalize book keys.

use std::collections::HashMap;

use crate::protocol::SymbolInfo;

#[derive(Debug, Default)]
pub struct SymbolRegistry {
    symbols: HashMap<String, SymbolInfo>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a symbols message; returns the symbols that changed
    pub fn apply(&mut self, symbols: &HashMap<String, SymbolInfo>) -> Vec<String> {
        let mut changed: Vec<String> = symbols
            .iter()
            .filter(|(name, info)| self.symbols.get(*name) != Some(*info))
            .map(|(name, _)| name.clone())
            .collect();
        changed.sort();

        for (name, info) in symbols {
            self.symbols.insert(name.clone(), info.clone());
        }
        changed
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols.get(symbol)
    }

    /// Decimal places of the symbol's minimum price increment
    pub fn price_scale(&self, symbol: &str) -> Option<u32> {
        self.symbols
            .get(symbol)
            .map(|info| info.min_price_increment_scale)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
