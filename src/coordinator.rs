//! Feed coordinator
//!
//! Owns every piece of feed state and turns inbound messages into one ordered
//! event stream. It is a plain state machine: the caller drives it with
//! messages, ticks and disconnects, and reads requests off the outbound
//! channel. Nothing here does I/O.

use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::balances::BalanceLedger;
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::orderbook::{BookManager, OrderBook, OrderBookState, PriceLevel, Side};
use crate::orders::{Order, OrderHandle, OrderTracker, ReportOutcome};
use crate::protocol::{
    Balance, BookLevels, Candle, Channel, ChannelEvent, ChannelId, InboundMessage,
    OrderCreationRequest, OutboundRequest, Payload, SubscribeParams, SymbolInfo, Ticker,
    TradePrint,
};
use crate::sequencer::{SequenceOutcome, Sequencer};
use crate::subscription::{
    SubscriptionHandle, SubscriptionManager, SubscriptionState, UnsubscribeOutcome,
};
use crate::symbols::SymbolRegistry;

/// Everything the application hears about
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Subscribed {
        id: ChannelId,
        handle: SubscriptionHandle,
    },
    Unsubscribed {
        id: ChannelId,
        handle: SubscriptionHandle,
    },
    SubscriptionRejected {
        id: ChannelId,
        handle: SubscriptionHandle,
        reason: String,
    },
    SubscriptionTimeout {
        id: ChannelId,
        handle: SubscriptionHandle,
    },
    SequenceGap {
        id: ChannelId,
        expected: u64,
        got: u64,
    },
    BookUpdated {
        id: ChannelId,
        seqnum: u64,
        snapshot: bool,
        best_bid: Option<PriceLevel>,
        best_ask: Option<PriceLevel>,
    },
    TradePrinted(TradePrint),
    TickerUpdated(Ticker),
    CandleUpdated(Candle),
    /// Symbols whose reference data changed
    SymbolsUpdated(Vec<String>),
    OrderChanged(Order),
    /// The full balance set after a balances message
    BalanceChanged(Vec<Balance>),
    Heartbeat {
        timestamp: Option<DateTime<Utc>>,
    },
    /// Connection lost; all subscriptions and books are gone
    Reset,
}

impl FeedEvent {
    /// Variant name, for logs that should not carry the payload
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Subscribed { .. } => "subscribed",
            FeedEvent::Unsubscribed { .. } => "unsubscribed",
            FeedEvent::SubscriptionRejected { .. } => "subscription_rejected",
            FeedEvent::SubscriptionTimeout { .. } => "subscription_timeout",
            FeedEvent::SequenceGap { .. } => "sequence_gap",
            FeedEvent::BookUpdated { .. } => "book_updated",
            FeedEvent::TradePrinted(_) => "trade_printed",
            FeedEvent::TickerUpdated(_) => "ticker_updated",
            FeedEvent::CandleUpdated(_) => "candle_updated",
            FeedEvent::SymbolsUpdated(_) => "symbols_updated",
            FeedEvent::OrderChanged(_) => "order_changed",
            FeedEvent::BalanceChanged(_) => "balance_changed",
            FeedEvent::Heartbeat { .. } => "heartbeat",
            FeedEvent::Reset => "reset",
        }
    }
}

/// Event channel fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    /// Free slots in the event channel
    pub available: usize,
    pub capacity: usize,
    /// Events dropped so far because the channel was full
    pub dropped: u64,
}

impl Backpressure {
    pub fn is_saturated(&self) -> bool {
        self.available == 0
    }
}

pub struct FeedCoordinator {
    subscriptions: SubscriptionManager,
    sequencer: Sequencer,
    books: BookManager,
    orders: OrderTracker,
    balances: BalanceLedger,
    symbols: SymbolRegistry,
    outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
    event_tx: mpsc::Sender<FeedEvent>,
    metrics: FeedMetrics,
    depth_levels: usize,
    /// Events dropped since the channel last accepted one
    drop_streak: u64,
}

impl FeedCoordinator {
    pub fn new(
        config: &Config,
        outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
        event_tx: mpsc::Sender<FeedEvent>,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(config.subscription_timeout()),
            sequencer: Sequencer::new(),
            books: BookManager::new(),
            orders: OrderTracker::new(),
            balances: BalanceLedger::new(),
            symbols: SymbolRegistry::new(),
            outbound_tx,
            event_tx,
            metrics,
            depth_levels: config.depth_levels,
            drop_streak: 0,
        }
    }

    /// Decode and handle one text frame; undecodable frames are counted and dropped
    pub fn handle_raw(&mut self, raw: &str, now: Instant) {
        match InboundMessage::parse(raw) {
            Ok(msg) => self.handle_message(msg, now),
            Err(e) => {
                self.metrics.malformed.inc();
                warn!(error = %e, len = raw.len(), "Dropping malformed message");
            }
        }
    }

    pub fn handle_message(&mut self, msg: InboundMessage, now: Instant) {
        let id = msg.channel_id();
        self.metrics
            .messages
            .with_label_values(&[msg.channel.as_str()])
            .inc();

        match msg.event {
            ChannelEvent::Subscribed => self.on_subscribed(&id),
            ChannelEvent::Unsubscribed => self.on_unsubscribed(&id, now),
            ChannelEvent::Rejected => {
                let reason = match msg.payload {
                    Payload::Control { text: Some(text) } => text,
                    _ => "no reason given".to_string(),
                };
                self.on_rejected(&id, reason);
            }
            ChannelEvent::Snapshot | ChannelEvent::Updated => self.on_data(id, msg, now),
        }

        if let Err(e) = self.flush_outbound() {
            warn!(error = %e, "Could not send subscription requests");
        }
    }

    fn on_subscribed(&mut self, id: &ChannelId) {
        if let Some(handle) = self.subscriptions.on_subscribed(id) {
            if id.channel.is_book() {
                self.sequencer.await_snapshot(id);
            } else {
                self.sequencer.reset(id);
            }
            self.emit(FeedEvent::Subscribed {
                id: id.clone(),
                handle,
            });
        }
    }

    fn on_unsubscribed(&mut self, id: &ChannelId, now: Instant) {
        match self.subscriptions.on_unsubscribed(id, now) {
            UnsubscribeOutcome::Idle(handle) => {
                self.drop_identity(id);
                self.emit(FeedEvent::Unsubscribed {
                    id: id.clone(),
                    handle,
                });
            }
            UnsubscribeOutcome::Resubscribing(handle) => {
                debug!(channel = %id, handle = %handle, "Resync unsubscribe confirmed");
                self.drop_identity(id);
            }
            UnsubscribeOutcome::Ignored => {}
        }
    }

    fn on_rejected(&mut self, id: &ChannelId, reason: String) {
        if let Some(handle) = self.subscriptions.on_rejected(id) {
            warn!(channel = %id, reason = %reason, "Subscription rejected by exchange");
            self.drop_identity(id);
            self.emit(FeedEvent::SubscriptionRejected {
                id: id.clone(),
                handle,
                reason,
            });
        }
    }

    fn on_data(&mut self, id: ChannelId, msg: InboundMessage, now: Instant) {
        if !self.subscriptions.is_active(&id) {
            debug!(channel = %id, seqnum = msg.seqnum, state = ?self.subscriptions.state(&id), "Dropping data for inactive subscription");
            return;
        }

        let outcome = if msg.is_snapshot() {
            self.sequencer.admit_snapshot(&id, msg.seqnum)
        } else {
            self.sequencer.admit(&id, msg.seqnum)
        };

        match outcome {
            SequenceOutcome::InOrder => self.route(&id, msg),
            SequenceOutcome::Duplicate => {
                self.metrics.duplicates.inc();
                debug!(channel = %id, seqnum = msg.seqnum, "Dropping duplicate");
            }
            SequenceOutcome::Suppressed => {
                debug!(channel = %id, seqnum = msg.seqnum, "Dropping message while desynchronized");
            }
            SequenceOutcome::Gap { expected, got } => self.on_gap(&id, expected, got, now),
        }
    }

    fn on_gap(&mut self, id: &ChannelId, expected: u64, got: u64, now: Instant) {
        warn!(channel = %id, expected, got, "Sequence gap detected");
        self.metrics
            .gaps
            .with_label_values(&[id.channel.as_str()])
            .inc();
        self.books.mark_stale(id);
        self.emit(FeedEvent::SequenceGap {
            id: id.clone(),
            expected,
            got,
        });

        if self.subscriptions.resync(id, now) {
            self.metrics.resyncs.inc();
        }
    }

    fn route(&mut self, id: &ChannelId, msg: InboundMessage) {
        let snapshot = msg.is_snapshot();
        let seqnum = msg.seqnum;

        match msg.payload {
            Payload::Book(levels) => self.apply_book(id, &levels, seqnum, snapshot),
            Payload::Trade(trade) => self.emit(FeedEvent::TradePrinted(trade)),
            Payload::Ticker(ticker) => self.emit(FeedEvent::TickerUpdated(ticker)),
            Payload::Candle(candle) => self.emit(FeedEvent::CandleUpdated(candle)),
            Payload::Symbols(symbols) => {
                let changed = self.symbols.apply(&symbols);
                if !changed.is_empty() {
                    self.emit(FeedEvent::SymbolsUpdated(changed));
                }
            }
            Payload::Orders(reports) => {
                for report in &reports {
                    match self.orders.apply_report(report, seqnum) {
                        ReportOutcome::Created(order) | ReportOutcome::Updated(order) => {
                            self.emit(FeedEvent::OrderChanged(order))
                        }
                        ReportOutcome::Ignored(reason) => {
                            self.metrics.ignored_order_reports.inc();
                            debug!(
                                order_id = ?report.order_id,
                                cl_ord_id = ?report.cl_ord_id,
                                reason = ?reason,
                                "Order report ignored"
                            );
                        }
                    }
                }
            }
            Payload::Balances(snapshot) => {
                let balances = self.balances.apply(&snapshot);
                self.emit(FeedEvent::BalanceChanged(balances));
            }
            Payload::Heartbeat => self.emit(FeedEvent::Heartbeat {
                timestamp: msg.timestamp,
            }),
            Payload::Control { .. } | Payload::Empty => {}
        }
    }

    fn apply_book(&mut self, id: &ChannelId, levels: &BookLevels, seqnum: u64, snapshot: bool) {
        let result = if snapshot {
            let price_scale = id
                .symbol
                .as_deref()
                .and_then(|symbol| self.symbols.price_scale(symbol));
            Ok(self.books.apply_snapshot(id, levels, seqnum, price_scale))
        } else {
            self.books.apply_update(id, levels, seqnum)
        }
        .map(|book| Self::book_event(id, book, seqnum, snapshot));

        match result {
            Ok(event) => self.emit(event),
            Err(FeedError::NoBaseline(_)) => {
                self.metrics.no_baseline.inc();
                warn!(channel = %id, seqnum, "Book update before snapshot");
            }
            Err(e) => warn!(channel = %id, seqnum, error = %e, "Failed to apply book update"),
        }
    }

    fn book_event(id: &ChannelId, book: &OrderBook, seqnum: u64, snapshot: bool) -> FeedEvent {
        FeedEvent::BookUpdated {
            id: id.clone(),
            seqnum,
            snapshot,
            best_bid: book.best(Side::Bid),
            best_ask: book.best(Side::Ask),
        }
    }

    /// Forget per-identity data once it leaves Subscribed
    fn drop_identity(&mut self, id: &ChannelId) {
        self.sequencer.reset(id);
        self.books.remove(id);
    }

    /// Subscribe with default parameters
    pub fn subscribe(
        &mut self,
        channel: Channel,
        symbol: Option<&str>,
        now: Instant,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_with(ChannelId::new(channel, symbol), SubscribeParams::default(), now)
    }

    pub fn subscribe_with(
        &mut self,
        id: ChannelId,
        params: SubscribeParams,
        now: Instant,
    ) -> Result<SubscriptionHandle> {
        let handle = self.subscriptions.subscribe(&id, params, now)?;
        self.flush_outbound()?;
        Ok(handle)
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle, now: Instant) -> Result<()> {
        let id = self
            .subscriptions
            .id_of(handle)
            .ok_or_else(|| FeedError::NotSubscribed(handle.to_string()))?;
        self.subscriptions.unsubscribe(handle, now)?;
        self.books.remove(&id);
        self.flush_outbound()
    }

    /// Submit a new order; the trading channel must be subscribed
    pub fn place_order(&mut self, request: OrderCreationRequest) -> Result<OrderHandle> {
        self.require_trading()?;

        let (handle, request) = self.orders.submit(request)?;
        info!(
            cl_ord_id = %handle,
            symbol = %request.symbol,
            side = ?request.side,
            qty = %request.order_qty,
            "Placing order"
        );

        if let Err(e) = self.send(OutboundRequest::new_order(request)) {
            if let Some(order) = self.orders.fail_submission(&handle, &e.to_string()) {
                self.emit(FeedEvent::OrderChanged(order));
            }
            return Err(e);
        }

        if let Some(order) = self.orders.get(handle.as_str()).cloned() {
            self.emit(FeedEvent::OrderChanged(order));
        }
        Ok(handle)
    }

    /// Cancel by exchange order id, or by client order id once acknowledged
    pub fn cancel_order(&mut self, id: &str) -> Result<()> {
        self.require_trading()?;

        let order_id = match self.orders.get(id) {
            Some(order) => order
                .order_id
                .clone()
                .ok_or_else(|| FeedError::OrderNotAcknowledged(id.to_string()))?,
            None => id.to_string(),
        };

        self.orders.mark_cancel_requested(&order_id);
        info!(order_id = %order_id, "Cancelling order");
        self.send(OutboundRequest::cancel(&order_id))
    }

    fn require_trading(&self) -> Result<()> {
        let trading = ChannelId::global(Channel::Trading);
        if self.subscriptions.is_active(&trading) {
            Ok(())
        } else {
            Err(FeedError::NotSubscribed(trading.to_string()))
        }
    }

    /// Time out subscription requests the exchange never answered
    pub fn tick(&mut self, now: Instant) {
        for expired in self.subscriptions.expire(now) {
            self.metrics.subscription_timeouts.inc();
            self.drop_identity(&expired.id);
            self.emit(FeedEvent::SubscriptionTimeout {
                id: expired.id,
                handle: expired.handle,
            });
        }
    }

    /// Transport lost: every identity returns to Idle and every book goes
    pub fn on_disconnect(&mut self) {
        let identities = self.subscriptions.reset();
        self.sequencer.clear();
        self.books.clear();
        info!(identities = identities.len(), "Feed reset after disconnect");
        self.emit(FeedEvent::Reset);
    }

    /// Unsubscribe everything and drop all market state
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        let identities = self.subscriptions.identities();
        for id in &identities {
            self.subscriptions.unsubscribe_id(id, now)?;
        }
        info!(identities = identities.len(), "Shutting down feed");

        self.sequencer.clear();
        self.books.clear();
        self.flush_outbound()
    }

    fn flush_outbound(&mut self) -> Result<()> {
        for request in self.subscriptions.drain_outbound() {
            self.send(request)?;
        }
        Ok(())
    }

    fn send(&self, request: OutboundRequest) -> Result<()> {
        self.outbound_tx
            .send(request)
            .map_err(|_| FeedError::TransportClosed)
    }

    /// Send without blocking; a full channel drops the event
    ///
    /// Only the first drop of a streak is logged at warn.
    fn emit(&mut self, event: FeedEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {
                if self.drop_streak > 0 {
                    info!(dropped = self.drop_streak, "Event channel accepting again");
                    self.drop_streak = 0;
                }
            }
            Err(TrySendError::Full(event)) => {
                self.metrics.dropped_events.inc();
                if self.drop_streak == 0 {
                    warn!(kind = event.kind(), "Event channel full, dropping events");
                } else {
                    debug!(kind = event.kind(), "Dropping event");
                }
                self.drop_streak += 1;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver dropped");
            }
        }
    }

    pub fn best(&self, symbol: &str, side: Side) -> Option<PriceLevel> {
        self.books.best(symbol, side)
    }

    pub fn depth(&self, symbol: &str, side: Side, n: usize) -> Vec<PriceLevel> {
        self.books.depth(symbol, side, n)
    }

    pub fn book_state(&self, symbol: &str) -> Option<OrderBookState> {
        self.books.get_state(symbol, self.depth_levels)
    }

    pub fn get_order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.open_orders()
    }

    pub fn get_balance(&self, currency: &str) -> Option<&Balance> {
        self.balances.get(currency)
    }

    pub fn balances(&self) -> Vec<Balance> {
        self.balances.all()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols.get(symbol)
    }

    pub fn subscription_state(&self, id: &ChannelId) -> SubscriptionState {
        self.subscriptions.state(id)
    }

    pub fn backpressure(&self) -> Backpressure {
        Backpressure {
            available: self.event_tx.capacity(),
            capacity: self.event_tx.max_capacity(),
            dropped: self.metrics.dropped_events.get(),
        }
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }
}
