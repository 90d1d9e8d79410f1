//! Order lifecycle tracking
//!
//! Orders live in an arena; client and exchange order ids index into it so
//! both keys reach the same record. A locally submitted order is known only
//! by its client id until the first execution report aliases the exchange id.
//! Terminal records are kept for a bounded window, oldest evicted first.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::protocol::{
    OrderCreationRequest, OrderKind, OrderReport, OrderSide, OrderStatus, OrderType,
    TimeInForce, MAX_CL_ORD_ID_LEN,
};

/// Client order id of a locally submitted order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OrderHandle(String);

impl OrderHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tracked order record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: Option<String>,
    pub cl_ord_id: Option<String>,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub ord_type: Option<OrderType>,
    pub order_qty: Decimal,
    pub leaves_qty: Decimal,
    pub cum_qty: Decimal,
    pub avg_px: Decimal,
    pub status: OrderStatus,
    pub time_in_force: Option<TimeInForce>,
    pub price: Option<Decimal>,
    pub stop_px: Option<Decimal>,
    pub last_px: Option<Decimal>,
    pub last_shares: Option<Decimal>,
    pub exec_id: Option<String>,
    pub exec_type: Option<String>,
    pub trade_id: Option<String>,
    pub text: Option<String>,
    pub transact_time: Option<DateTime<Utc>>,
    /// Seqnum of the last report applied
    pub last_seqnum: Option<u64>,
    pub cancel_requested: bool,
}

impl Order {
    fn pending(cl_ord_id: &str, request: &OrderCreationRequest) -> Self {
        Self {
            order_id: None,
            cl_ord_id: Some(cl_ord_id.to_string()),
            symbol: request.symbol.clone(),
            side: Some(request.side),
            ord_type: Some(request.order_type()),
            order_qty: request.order_qty,
            leaves_qty: request.order_qty,
            cum_qty: Decimal::ZERO,
            avg_px: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force: request.time_in_force(),
            price: request.price(),
            stop_px: match request.kind {
                OrderKind::Stop { stop_px, .. } | OrderKind::StopLimit { stop_px, .. } => {
                    Some(stop_px)
                }
                _ => None,
            },
            last_px: None,
            last_shares: None,
            exec_id: None,
            exec_type: None,
            trade_id: None,
            text: None,
            transact_time: None,
            last_seqnum: None,
            cancel_requested: false,
        }
    }

    fn from_report(report: &OrderReport, seqnum: u64) -> Self {
        let order_qty = report.order_qty.unwrap_or_default();
        let cum_qty = report.cum_qty.unwrap_or_default();
        let mut order = Self {
            order_id: report.order_id.clone(),
            cl_ord_id: report.cl_ord_id.clone(),
            symbol: report.symbol.clone().unwrap_or_default(),
            side: report.side,
            ord_type: report.ord_type,
            order_qty,
            leaves_qty: report.leaves_qty.unwrap_or(order_qty - cum_qty),
            cum_qty,
            avg_px: Decimal::ZERO,
            status: report.ord_status,
            time_in_force: None,
            price: None,
            stop_px: None,
            last_px: None,
            last_shares: None,
            exec_id: None,
            exec_type: None,
            trade_id: None,
            text: None,
            transact_time: None,
            last_seqnum: None,
            cancel_requested: false,
        };
        order.apply(report, seqnum);
        order
    }

    /// Frozen records ignore further reports
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
            || (self.status != OrderStatus::Pending && self.leaves_qty.is_zero())
    }

    /// Reports are ordered by transact time, then by seqnum
    fn is_stale(&self, report: &OrderReport, seqnum: u64) -> bool {
        match (self.transact_time, report.transact_time) {
            (Some(prev), Some(next)) if prev != next => next < prev,
            _ => self.last_seqnum.is_some_and(|last| seqnum <= last),
        }
    }

    fn apply(&mut self, report: &OrderReport, seqnum: u64) {
        self.status = report.ord_status;
        if let Some(symbol) = &report.symbol {
            self.symbol = symbol.clone();
        }
        self.side = report.side.or(self.side);
        self.ord_type = report.ord_type.or(self.ord_type);
        self.time_in_force = report.time_in_force.or(self.time_in_force);
        if let Some(qty) = report.order_qty {
            self.order_qty = qty;
        }
        if let Some(qty) = report.leaves_qty {
            self.leaves_qty = qty;
        }
        if let Some(qty) = report.cum_qty {
            self.cum_qty = qty;
        }
        if let Some(px) = report.avg_px {
            self.avg_px = px;
        }
        self.price = report.price.or(self.price);
        self.stop_px = report.stop_px.or(self.stop_px);
        self.last_px = report.last_px.or(self.last_px);
        self.last_shares = report.last_shares.or(self.last_shares);
        self.exec_id = report.exec_id.clone().or(self.exec_id.take());
        self.exec_type = report.exec_type.clone().or(self.exec_type.take());
        self.trade_id = report.trade_id.clone().or(self.trade_id.take());
        self.text = report.text.clone().or(self.text.take());
        self.transact_time = report.transact_time.or(self.transact_time);
        self.last_seqnum = Some(seqnum);
        if self.is_terminal() {
            self.cancel_requested = false;
        }
    }
}

/// Why a report was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The order already reached a final state
    Terminal,
    /// Older than the last applied report
    Stale,
    /// Carries neither an exchange nor a client order id
    Unidentified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Created(Order),
    Updated(Order),
    Ignored(IgnoreReason),
}

/// Terminal records kept for lookup before eviction
pub const DEFAULT_ORDER_RETENTION: usize = 10_000;

#[derive(Debug)]
pub struct OrderTracker {
    orders: Vec<Option<Order>>,
    free: Vec<usize>,
    /// Terminal slots, oldest first
    retired: VecDeque<usize>,
    retention: usize,
    by_client: HashMap<String, usize>,
    by_exchange: HashMap<String, usize>,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_ORDER_RETENTION)
    }
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            orders: Vec::new(),
            free: Vec::new(),
            retired: VecDeque::new(),
            retention,
            by_client: HashMap::new(),
            by_exchange: HashMap::new(),
        }
    }

    fn slot(&self, idx: usize) -> Option<&Order> {
        self.orders.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Order> {
        self.orders.get_mut(idx).and_then(Option::as_mut)
    }

    fn insert(&mut self, order: Order) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.orders[idx] = Some(order);
                idx
            }
            None => {
                self.orders.push(Some(order));
                self.orders.len() - 1
            }
        }
    }

    /// Queue a slot that just turned terminal and evict past the window
    fn retire(&mut self, idx: usize) {
        self.retired.push_back(idx);
        while self.retired.len() > self.retention {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            let Some(order) = self.orders.get_mut(oldest).and_then(Option::take) else {
                continue;
            };
            // a reused client id may already point at a newer record
            if let Some(id) = &order.cl_ord_id {
                if self.by_client.get(id) == Some(&oldest) {
                    self.by_client.remove(id);
                }
            }
            if let Some(id) = &order.order_id {
                if self.by_exchange.get(id) == Some(&oldest) {
                    self.by_exchange.remove(id);
                }
            }
            self.free.push(oldest);
            debug!(order_id = ?order.order_id, cl_ord_id = ?order.cl_ord_id, "Evicted terminal order");
        }
    }

    /// Record a local order before the exchange acknowledges it
    ///
    /// Returns the handle and the request with its client order id filled in.
    pub fn submit(
        &mut self,
        mut request: OrderCreationRequest,
    ) -> Result<(OrderHandle, OrderCreationRequest)> {
        if request.cl_ord_id.is_empty() {
            request.cl_ord_id = Self::generate_cl_ord_id();
        }
        request.validate()?;

        if let Some(&idx) = self.by_client.get(&request.cl_ord_id) {
            if self.slot(idx).is_some_and(|order| !order.is_terminal()) {
                return Err(FeedError::DuplicateClientOrderId(request.cl_ord_id));
            }
        }

        let idx = self.insert(Order::pending(&request.cl_ord_id, &request));
        self.by_client.insert(request.cl_ord_id.clone(), idx);

        debug!(cl_ord_id = %request.cl_ord_id, symbol = %request.symbol, "Order submitted");
        Ok((OrderHandle(request.cl_ord_id.clone()), request))
    }

    /// Apply an execution report from the trading channel
    pub fn apply_report(&mut self, report: &OrderReport, seqnum: u64) -> ReportOutcome {
        let idx = report
            .order_id
            .as_ref()
            .and_then(|id| self.by_exchange.get(id))
            .or_else(|| {
                report
                    .cl_ord_id
                    .as_ref()
                    .and_then(|id| self.by_client.get(id))
            })
            .copied();

        let Some(idx) = idx else {
            if report.order_id.is_none() && report.cl_ord_id.is_none() {
                warn!(status = ?report.ord_status, "Order report without any order id");
                return ReportOutcome::Ignored(IgnoreReason::Unidentified);
            }
            let order = Order::from_report(report, seqnum);
            let idx = self.insert(order.clone());
            self.index(idx, &order);
            debug!(order_id = ?order.order_id, status = ?order.status, "Tracking order from exchange report");
            if order.is_terminal() {
                self.retire(idx);
            }
            return ReportOutcome::Created(order);
        };

        let Some(order) = self.slot_mut(idx) else {
            return ReportOutcome::Ignored(IgnoreReason::Terminal);
        };
        if order.is_terminal() {
            debug!(
                order_id = ?order.order_id,
                status = ?order.status,
                report_status = ?report.ord_status,
                "Ignoring report for terminal order"
            );
            return ReportOutcome::Ignored(IgnoreReason::Terminal);
        }
        if order.is_stale(report, seqnum) {
            debug!(order_id = ?order.order_id, seqnum, "Ignoring stale order report");
            return ReportOutcome::Ignored(IgnoreReason::Stale);
        }

        if order.order_id.is_none() {
            order.order_id = report.order_id.clone();
        }
        if order.cl_ord_id.is_none() {
            order.cl_ord_id = report.cl_ord_id.clone();
        }
        order.apply(report, seqnum);

        let order = order.clone();
        self.index(idx, &order);
        if order.is_terminal() {
            self.retire(idx);
        }
        ReportOutcome::Updated(order)
    }

    fn index(&mut self, idx: usize, order: &Order) {
        if let Some(id) = &order.order_id {
            self.by_exchange.insert(id.clone(), idx);
        }
        if let Some(id) = &order.cl_ord_id {
            self.by_client.insert(id.clone(), idx);
        }
    }

    /// Mark a locally submitted order as refused before reaching the exchange
    pub fn fail_submission(&mut self, handle: &OrderHandle, reason: &str) -> Option<Order> {
        let &idx = self.by_client.get(handle.as_str())?;
        let order = self.slot_mut(idx)?;
        let was_terminal = order.is_terminal();
        order.status = OrderStatus::Rejected;
        order.text = Some(reason.to_string());
        let order = order.clone();
        if !was_terminal {
            self.retire(idx);
        }
        Some(order)
    }

    /// Look up by exchange order id, then client order id
    pub fn get(&self, id: &str) -> Option<&Order> {
        self.by_exchange
            .get(id)
            .or_else(|| self.by_client.get(id))
            .and_then(|&idx| self.slot(idx))
    }

    pub fn exchange_id_for(&self, id: &str) -> Option<String> {
        self.get(id).and_then(|order| order.order_id.clone())
    }

    pub fn mark_cancel_requested(&mut self, id: &str) -> bool {
        let idx = self
            .by_exchange
            .get(id)
            .or_else(|| self.by_client.get(id))
            .copied();
        match idx.and_then(|idx| self.slot_mut(idx)) {
            Some(order) if !order.is_terminal() => {
                order.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders
            .iter()
            .flatten()
            .filter(|o| !o.is_terminal())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generate_cl_ord_id() -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(MAX_CL_ORD_ID_LEN);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn limit_order() -> OrderCreationRequest {
        OrderCreationRequest::limit(
            "BTC-USD",
            OrderSide::Buy,
            dec!(10),
            dec!(50),
            TimeInForce::GoodTillCancel,
        )
    }

    fn report(order_id: &str, cl_ord_id: &str, status: OrderStatus, cum: Decimal, leaves: Decimal) -> OrderReport {
        OrderReport {
            order_id: Some(order_id.to_string()),
            cl_ord_id: Some(cl_ord_id.to_string()),
            symbol: Some("BTC-USD".to_string()),
            side: Some(OrderSide::Buy),
            ord_type: Some(OrderType::Limit),
            order_qty: Some(cum + leaves),
            leaves_qty: Some(leaves),
            cum_qty: Some(cum),
            avg_px: Some(dec!(50)),
            ord_status: status,
            time_in_force: Some(TimeInForce::GoodTillCancel),
            text: None,
            exec_type: None,
            exec_id: None,
            transact_time: None,
            msg_type: Some(8),
            last_px: None,
            last_shares: None,
            trade_id: None,
            price: Some(dec!(50)),
            stop_px: None,
        }
    }

    #[test]
    fn test_submit_generates_client_id() {
        let mut tracker = OrderTracker::new();
        let (handle, request) = tracker.submit(limit_order()).unwrap();
        assert_eq!(handle.as_str().len(), MAX_CL_ORD_ID_LEN);
        assert_eq!(request.cl_ord_id, handle.as_str());

        let order = tracker.get(handle.as_str()).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.leaves_qty, dec!(10));
        assert_eq!(order.price, Some(dec!(50)));
    }

    #[test]
    fn test_duplicate_live_client_id_rejected() {
        let mut tracker = OrderTracker::new();
        tracker.submit(limit_order().with_cl_ord_id("dup")).unwrap();
        assert!(matches!(
            tracker.submit(limit_order().with_cl_ord_id("dup")),
            Err(FeedError::DuplicateClientOrderId(_))
        ));
    }

    #[test]
    fn test_first_report_aliases_exchange_id() {
        let mut tracker = OrderTracker::new();
        let (handle, _) = tracker.submit(limit_order().with_cl_ord_id("c1")).unwrap();

        let outcome = tracker.apply_report(&report("900", "c1", OrderStatus::Open, dec!(0), dec!(10)), 1);
        assert!(matches!(outcome, ReportOutcome::Updated(_)));
        assert_eq!(tracker.len(), 1);

        let by_exchange = tracker.get("900").unwrap();
        let by_client = tracker.get(handle.as_str()).unwrap();
        assert_eq!(by_exchange, by_client);
        assert_eq!(by_exchange.status, OrderStatus::Open);
        assert_eq!(tracker.exchange_id_for("c1").as_deref(), Some("900"));
    }

    #[test]
    fn test_partial_fill_then_stale_report_ignored() {
        let mut tracker = OrderTracker::new();
        tracker.submit(limit_order().with_cl_ord_id("c1")).unwrap();

        tracker.apply_report(&report("900", "c1", OrderStatus::Partial, dec!(4), dec!(6)), 5);
        let outcome = tracker.apply_report(&report("900", "c1", OrderStatus::Open, dec!(0), dec!(10)), 4);
        assert_eq!(outcome, ReportOutcome::Ignored(IgnoreReason::Stale));

        let order = tracker.get("900").unwrap();
        assert_eq!(order.cum_qty, dec!(4));
        assert_eq!(order.leaves_qty, dec!(6));
        assert_eq!(order.status, OrderStatus::Partial);
    }

    #[test]
    fn test_transact_time_orders_reports() {
        let mut tracker = OrderTracker::new();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();

        let mut first = report("900", "c1", OrderStatus::Partial, dec!(4), dec!(6));
        first.transact_time = Some(late);
        tracker.apply_report(&first, 1);

        // higher seqnum but older execution
        let mut second = report("900", "c1", OrderStatus::Open, dec!(0), dec!(10));
        second.transact_time = Some(early);
        assert_eq!(
            tracker.apply_report(&second, 2),
            ReportOutcome::Ignored(IgnoreReason::Stale)
        );
    }

    #[test]
    fn test_terminal_order_is_frozen() {
        let mut tracker = OrderTracker::new();
        tracker.apply_report(&report("901", "c2", OrderStatus::Open, dec!(0), dec!(5)), 1);
        tracker.apply_report(&report("901", "c2", OrderStatus::Cancelled, dec!(0), dec!(0)), 2);

        let outcome = tracker.apply_report(&report("901", "c2", OrderStatus::Partial, dec!(1), dec!(4)), 3);
        assert_eq!(outcome, ReportOutcome::Ignored(IgnoreReason::Terminal));

        let order = tracker.get("901").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.leaves_qty, dec!(0));
        assert!(tracker.open_orders().is_empty());
    }

    #[test]
    fn test_fully_filled_is_terminal() {
        let mut tracker = OrderTracker::new();
        tracker.apply_report(&report("902", "c3", OrderStatus::Partial, dec!(5), dec!(0)), 1);
        assert!(tracker.get("902").unwrap().is_terminal());
        assert!(!tracker.mark_cancel_requested("902"));
    }

    #[test]
    fn test_unidentified_report() {
        let mut tracker = OrderTracker::new();
        let mut anonymous = report("x", "y", OrderStatus::Rejected, dec!(0), dec!(0));
        anonymous.order_id = None;
        anonymous.cl_ord_id = None;
        assert_eq!(
            tracker.apply_report(&anonymous, 1),
            ReportOutcome::Ignored(IgnoreReason::Unidentified)
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_cancel_flag_and_failed_submission() {
        let mut tracker = OrderTracker::new();
        let (handle, _) = tracker.submit(limit_order()).unwrap();
        assert!(tracker.mark_cancel_requested(handle.as_str()));
        assert!(tracker.get(handle.as_str()).unwrap().cancel_requested);

        let failed = tracker.fail_submission(&handle, "transport closed").unwrap();
        assert_eq!(failed.status, OrderStatus::Rejected);
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_terminal_orders_evicted_past_retention() {
        let mut tracker = OrderTracker::with_retention(2);
        for n in 0..3 {
            let (order_id, cl_ord_id) = (format!("90{n}"), format!("c{n}"));
            tracker.apply_report(&report(&order_id, &cl_ord_id, OrderStatus::Open, dec!(0), dec!(5)), 1);
            tracker.apply_report(&report(&order_id, &cl_ord_id, OrderStatus::Filled, dec!(5), dec!(0)), 2);
        }
        tracker.apply_report(&report("950", "live", OrderStatus::Open, dec!(0), dec!(5)), 1);

        // oldest terminal record and both of its keys are gone
        assert!(tracker.get("900").is_none());
        assert!(tracker.get("c0").is_none());
        assert_eq!(tracker.get("c1").unwrap().status, OrderStatus::Filled);
        assert_eq!(tracker.get("902").unwrap().status, OrderStatus::Filled);
        assert_eq!(tracker.get("950").unwrap().status, OrderStatus::Open);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.open_orders().len(), 1);

        // 950 took the freed slot
        tracker.apply_report(&report("960", "c6", OrderStatus::Open, dec!(0), dec!(1)), 1);
        assert_eq!(tracker.orders.len(), 4);
    }

    #[test]
    fn test_eviction_keeps_reused_client_id() {
        let mut tracker = OrderTracker::with_retention(1);
        let (first, _) = tracker.submit(limit_order().with_cl_ord_id("again")).unwrap();
        tracker.fail_submission(&first, "first").unwrap();

        let (second, _) = tracker.submit(limit_order().with_cl_ord_id("again")).unwrap();
        tracker.apply_report(&report("970", "again", OrderStatus::Open, dec!(0), dec!(10)), 1);
        tracker.apply_report(&report("970", "again", OrderStatus::Cancelled, dec!(0), dec!(0)), 2);

        // the first record is evicted without unlinking the newer one
        assert_eq!(tracker.len(), 1);
        let order = tracker.get(second.as_str()).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(tracker.get("970"), Some(order));
    }
}
