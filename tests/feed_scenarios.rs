//! Feed replay scenarios
//!
//! Drives a coordinator with recorded-style exchange frames and checks the
//! resulting books, orders and event stream.

use std::time::{Duration, Instant};

use bcx_feed::orderbook::{OrderBook, PriceLevel};
use bcx_feed::protocol::{BookLevels, OrderSide, OrderStatus, SubscribeParams, TimeInForce};
use bcx_feed::{
    Channel, ChannelId, Config, FeedCoordinator, FeedEvent, FeedMetrics, OrderCreationRequest,
    OutboundRequest, Side, SubscriptionState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Replay {
    feed: FeedCoordinator,
    outbound: mpsc::UnboundedReceiver<OutboundRequest>,
    events: mpsc::Receiver<FeedEvent>,
    now: Instant,
}

impl Replay {
    fn new() -> Self {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(1024);
        let feed = FeedCoordinator::new(
            &Config::default(),
            outbound_tx,
            event_tx,
            FeedMetrics::new().unwrap(),
        );
        Self {
            feed,
            outbound,
            events,
            now: Instant::now(),
        }
    }

    fn frame(&mut self, frame: Value) {
        self.feed.handle_raw(&frame.to_string(), self.now);
    }

    fn confirm(&mut self, channel: &str, symbol: Option<&str>) {
        let mut frame = json!({"seqnum": 0, "event": "subscribed", "channel": channel});
        if let Some(symbol) = symbol {
            frame["symbol"] = json!(symbol);
        }
        self.frame(frame);
    }

    fn requests(&mut self) -> Vec<OutboundRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.outbound.try_recv() {
            requests.push(request);
        }
        requests
    }

    fn events(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn px(price: &str, qty: &str) -> Value {
    json!({"px": price.parse::<f64>().unwrap(), "qty": qty.parse::<f64>().unwrap(), "num": 1})
}

fn book_frame(seqnum: u64, event: &str, bids: Vec<Value>, asks: Vec<Value>) -> Value {
    json!({
        "seqnum": seqnum,
        "event": event,
        "channel": "l2",
        "symbol": "BTC-USD",
        "bids": bids,
        "asks": asks,
    })
}

fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
    PriceLevel::new(price, quantity, 1)
}

#[test]
fn test_in_order_replay_matches_direct_application() {
    let mut replay = Replay::new();
    replay.feed.subscribe(Channel::L2, Some("BTC-USD"), replay.now).unwrap();
    replay.confirm("l2", Some("BTC-USD"));

    let updates = vec![
        (vec![px("100", "1")], vec![px("105", "2")]),
        (vec![px("101", "3")], vec![]),
        (vec![px("100", "0")], vec![px("104", "1")]),
        (vec![], vec![px("105", "0")]),
        (vec![px("99.5", "4")], vec![px("104", "2.5")]),
    ];

    replay.frame(book_frame(1, "snapshot", vec![px("98", "1")], vec![px("106", "1")]));
    for (i, (bids, asks)) in updates.iter().enumerate() {
        replay.frame(book_frame(i as u64 + 2, "updated", bids.clone(), asks.clone()));
    }

    let mut direct = OrderBook::new("BTC-USD");
    direct.apply_snapshot(&[level(dec!(98), dec!(1))], &[level(dec!(106), dec!(1))], 1);
    for (i, (bids, asks)) in updates.into_iter().enumerate() {
        let levels: BookLevels = serde_json::from_value(json!({"bids": bids, "asks": asks})).unwrap();
        direct.apply_levels(&levels, i as u64 + 2).unwrap();
    }

    for side in [Side::Bid, Side::Ask] {
        assert_eq!(replay.feed.depth("BTC-USD", side, 50), direct.depth(side, 50));
    }
    assert_eq!(replay.feed.best("BTC-USD", Side::Bid).unwrap().price, dec!(101));
    assert_eq!(replay.feed.best("BTC-USD", Side::Ask).unwrap().price, dec!(104));
}

#[test]
fn test_removed_level_can_be_restored() {
    let mut replay = Replay::new();
    replay.feed.subscribe(Channel::L2, Some("BTC-USD"), replay.now).unwrap();
    replay.confirm("l2", Some("BTC-USD"));

    replay.frame(book_frame(1, "snapshot", vec![px("100", "2"), px("99", "1")], vec![]));
    replay.frame(book_frame(2, "updated", vec![px("100", "0")], vec![]));
    let prices: Vec<Decimal> = replay
        .feed
        .depth("BTC-USD", Side::Bid, 10)
        .iter()
        .map(|level| level.price)
        .collect();
    assert_eq!(prices, vec![dec!(99)]);

    replay.frame(book_frame(3, "updated", vec![px("100", "5")], vec![]));
    let depth = replay.feed.depth("BTC-USD", Side::Bid, 10);
    assert_eq!(depth.len(), 2);
    assert_eq!(depth[0].price, dec!(100));
    assert_eq!(depth[0].quantity, dec!(5));
}

#[test]
fn test_symbol_scale_normalizes_price_keys() {
    let mut replay = Replay::new();
    replay.feed.subscribe(Channel::Symbols, None, replay.now).unwrap();
    replay.confirm("symbols", None);
    replay.frame(json!({
        "seqnum": 1,
        "event": "snapshot",
        "channel": "symbols",
        "symbols": {
            "BTC-USD": {
                "base_currency": "BTC",
                "base_currency_scale": 8,
                "counter_currency": "USD",
                "counter_currency_scale": 2,
                "min_price_increment": 1,
                "min_price_increment_scale": 2,
                "min_order_size": 50,
                "min_order_size_scale": 8,
                "max_order_size": 0,
                "max_order_size_scale": 8,
                "lot_size": 5,
                "lot_size_scale": 8,
                "status": "open",
                "id": 1
            }
        }
    }));
    assert_eq!(replay.feed.symbol("BTC-USD").unwrap().tick_size(), dec!(0.01));

    replay.feed.subscribe(Channel::L2, Some("BTC-USD"), replay.now).unwrap();
    replay.confirm("l2", Some("BTC-USD"));
    replay.frame(book_frame(1, "snapshot", vec![px("100.004", "1")], vec![]));
    replay.frame(book_frame(2, "updated", vec![px("100.001", "3")], vec![]));

    let depth = replay.feed.depth("BTC-USD", Side::Bid, 10);
    assert_eq!(depth.len(), 1);
    assert_eq!(depth[0].price, dec!(100));
    assert_eq!(depth[0].quantity, dec!(3));
}

#[test]
fn test_session_with_gap_resync_and_market_channels() {
    let mut replay = Replay::new();
    let l2 = ChannelId::symbol_scoped(Channel::L2, "BTC-USD");

    for channel in [Channel::L2, Channel::Trades, Channel::Ticker] {
        replay.feed.subscribe(channel, Some("BTC-USD"), replay.now).unwrap();
        replay.confirm(channel.as_str(), Some("BTC-USD"));
    }
    assert_eq!(replay.requests().len(), 3);
    replay.events();

    replay.frame(json!({
        "seqnum": 1, "event": "updated", "channel": "trades", "symbol": "BTC-USD",
        "timestamp": "2019-08-13T11:30:06.100140Z",
        "side": "sell", "qty": 8.5e-5, "price": 11252.4, "trade_id": "12884909920"
    }));
    replay.frame(json!({
        "seqnum": 1, "event": "snapshot", "channel": "ticker", "symbol": "BTC-USD",
        "price_24h": 4988.0, "volume_24h": 0.3015, "last_trade_price": 5000.0
    }));
    let events = replay.events();
    assert!(matches!(&events[0], FeedEvent::TradePrinted(trade) if trade.side == OrderSide::Sell));
    assert!(matches!(&events[1], FeedEvent::TickerUpdated(ticker) if ticker.last_trade_price == Some(dec!(5000))));

    replay.frame(book_frame(10, "snapshot", vec![px("100", "1")], vec![px("101", "1")]));
    replay.frame(book_frame(11, "updated", vec![px("100", "2")], vec![]));
    replay.frame(book_frame(13, "updated", vec![px("100", "9")], vec![]));
    replay.frame(book_frame(14, "updated", vec![px("100", "9")], vec![]));

    // one resync, trades and ticker untouched
    assert_eq!(
        replay.requests(),
        vec![OutboundRequest::unsubscribe(&l2, &SubscribeParams::default())]
    );
    assert_eq!(replay.feed.subscription_state(&l2), SubscriptionState::Unsubscribing);
    assert_eq!(
        replay.feed.subscription_state(&ChannelId::symbol_scoped(Channel::Trades, "BTC-USD")),
        SubscriptionState::Subscribed
    );
    // pre-gap levels are not served while the book resyncs
    assert!(replay.feed.best("BTC-USD", Side::Bid).is_none());
    assert!(replay.feed.book_state("BTC-USD").unwrap().stale);

    replay.frame(json!({"seqnum": 0, "event": "unsubscribed", "channel": "l2", "symbol": "BTC-USD"}));
    assert_eq!(
        replay.requests(),
        vec![OutboundRequest::subscribe(&l2, &SubscribeParams::default())]
    );
    replay.confirm("l2", Some("BTC-USD"));
    replay.frame(book_frame(20, "snapshot", vec![px("100", "9")], vec![px("101", "1")]));
    replay.frame(book_frame(21, "updated", vec![], vec![px("101", "0")]));

    assert_eq!(replay.feed.best("BTC-USD", Side::Bid).unwrap().quantity, dec!(9));
    assert!(replay.feed.best("BTC-USD", Side::Ask).is_none());
    assert_eq!(replay.feed.metrics().gaps.with_label_values(&["l2"]).get(), 1);
    assert_eq!(replay.feed.metrics().resyncs.get(), 1);

    let gaps = replay
        .events()
        .into_iter()
        .filter(|event| matches!(event, FeedEvent::SequenceGap { .. }))
        .count();
    assert_eq!(gaps, 1);
}

#[test]
fn test_order_flow_to_terminal_state() {
    let mut replay = Replay::new();
    replay.feed.subscribe(Channel::Trading, None, replay.now).unwrap();
    replay.confirm("trading", None);

    let handle = replay
        .feed
        .place_order(
            OrderCreationRequest::limit(
                "BTC-USD",
                OrderSide::Sell,
                dec!(2),
                dec!(20000),
                TimeInForce::GoodTillCancel,
            )
            .with_cl_ord_id("sell-1"),
        )
        .unwrap();
    assert_eq!(handle.as_str(), "sell-1");

    let report = |seqnum: u64, status: &str, cum: f64, leaves: f64, time: &str| {
        json!({
            "seqnum": seqnum, "event": "updated", "channel": "trading",
            "orderID": 12891851020u64, "clOrdID": "sell-1", "symbol": "BTC-USD",
            "side": "sell", "ordType": "limit", "orderQty": 2.0,
            "cumQty": cum, "leavesQty": leaves, "ordStatus": status,
            "transactTime": time, "price": 20000.0
        })
    };

    replay.frame(report(1, "open", 0.0, 2.0, "2019-08-13T11:30:03.000Z"));
    replay.feed.cancel_order("sell-1").unwrap();
    replay.frame(report(2, "cancelled", 0.0, 0.0, "2019-08-13T11:30:05.000Z"));
    replay.frame(report(3, "partial", 1.0, 1.0, "2019-08-13T11:30:06.000Z"));

    let order = replay.feed.get_order("12891851020").unwrap();
    assert_eq!(order.cl_ord_id.as_deref(), Some("sell-1"));
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.leaves_qty, Decimal::ZERO);
    assert!(replay.feed.open_orders().is_empty());

    let requests = replay.requests();
    assert!(requests.contains(&OutboundRequest::cancel("12891851020")));
}

#[test]
fn test_timeout_then_reconnect_reset() {
    let mut replay = Replay::new();
    replay.feed.subscribe(Channel::Heartbeat, None, replay.now).unwrap();
    replay.feed.subscribe(Channel::L2, Some("ETH-USD"), replay.now).unwrap();
    replay.confirm("heartbeat", None);

    replay.feed.tick(replay.now + Duration::from_secs(11));
    let events = replay.events();
    assert!(events.iter().any(|event| matches!(
        event,
        FeedEvent::SubscriptionTimeout { id, .. } if id.channel == Channel::L2
    )));
    assert_eq!(
        replay.feed.subscription_state(&ChannelId::global(Channel::Heartbeat)),
        SubscriptionState::Subscribed
    );

    replay.feed.on_disconnect();
    assert_eq!(
        replay.feed.subscription_state(&ChannelId::global(Channel::Heartbeat)),
        SubscriptionState::Idle
    );
    assert_eq!(replay.events(), vec![FeedEvent::Reset]);
}
