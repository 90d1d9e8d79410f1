//! Account balance ledger
//!
//! The balances channel publishes the full account on every message, so each
//! snapshot replaces the ledger. Currencies missing from a snapshot are
//! dropped.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::protocol::{Balance, BalancesSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BalanceTotals {
    pub available_local: Decimal,
    pub balance_local: Decimal,
}

#[derive(Debug, Default)]
pub struct BalanceLedger {
    balances: HashMap<String, Balance>,
    totals: BalanceTotals,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ledger, returning the new balance set
    pub fn apply(&mut self, snapshot: &BalancesSnapshot) -> Vec<Balance> {
        self.balances = snapshot
            .balances
            .iter()
            .map(|balance| (balance.currency.clone(), balance.clone()))
            .collect();
        self.totals = BalanceTotals {
            available_local: snapshot.total_available_local,
            balance_local: snapshot.total_balance_local,
        };
        self.all()
    }

    pub fn get(&self, currency: &str) -> Option<&Balance> {
        self.balances.get(currency)
    }

    /// All balances, sorted by currency
    pub fn all(&self) -> Vec<Balance> {
        let mut balances: Vec<Balance> = self.balances.values().cloned().collect();
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        balances
    }

    pub fn totals(&self) -> BalanceTotals {
        self.totals
    }

    pub fn clear(&mut self) {
        self.balances.clear();
        self.totals = BalanceTotals::default();
    }
}
