//! Inbound message decoding
//!
//! Messages share an envelope (`seqnum`, `event`, `channel`, optional `symbol`
//! and `timestamp`); the remaining keys are decoded according to the channel
//! tag. Ticker and trade payloads are told apart by channel, never by shape.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{Channel, ChannelEvent, ChannelId, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::error::{FeedError, Result};

/// A decoded feed message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub seqnum: u64,
    pub channel: Channel,
    pub event: ChannelEvent,
    pub symbol: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Payload,
}

/// Channel specific payload
#[derive(Debug, Clone)]
pub enum Payload {
    /// subscribed / unsubscribed / rejected, with the exchange's reason text
    Control { text: Option<String> },
    Heartbeat,
    Book(BookLevels),
    Candle(Candle),
    Symbols(HashMap<String, SymbolInfo>),
    Ticker(Ticker),
    Trade(TradePrint),
    Orders(Vec<OrderReport>),
    Balances(BalancesSnapshot),
    Empty,
}

/// A single book level as sent on the l2/l3 channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(rename = "px")]
    pub price: Decimal,
    #[serde(rename = "qty")]
    pub quantity: Decimal,
    /// Order count at the level (l2) or the exchange order number (l3)
    #[serde(rename = "num", default)]
    pub order_count: u64,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal, order_count: u64) -> Self {
        Self {
            price,
            quantity,
            order_count,
        }
    }
}

/// Bid and ask levels of a book snapshot or update
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookLevels {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

/// OHLCV candle from the prices channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymbolStatus {
    Open,
    Close,
    Suspend,
    Halt,
    HaltFreeze,
}

/// Symbol reference data from the symbols channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub base_currency: String,
    #[serde(default)]
    pub base_currency_scale: u32,
    pub counter_currency: String,
    #[serde(default)]
    pub counter_currency_scale: u32,
    #[serde(default)]
    pub min_price_increment: i64,
    #[serde(default)]
    pub min_price_increment_scale: u32,
    #[serde(default)]
    pub min_order_size: i64,
    #[serde(default)]
    pub min_order_size_scale: u32,
    #[serde(default)]
    pub max_order_size: i64,
    #[serde(default)]
    pub max_order_size_scale: u32,
    #[serde(default)]
    pub lot_size: i64,
    #[serde(default)]
    pub lot_size_scale: u32,
    pub status: SymbolStatus,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub auction_price: Decimal,
    #[serde(default)]
    pub auction_size: Decimal,
    #[serde(default)]
    pub auction_time: String,
    #[serde(default)]
    pub imbalance: Decimal,
}

impl SymbolInfo {
    /// Smallest price step, e.g. increment 10 at scale 2 is 0.10
    pub fn tick_size(&self) -> Decimal {
        Decimal::new(self.min_price_increment, self.min_price_increment_scale)
    }

    pub fn min_order_size(&self) -> Decimal {
        Decimal::new(self.min_order_size, self.min_order_size_scale)
    }

    /// Zero means the exchange publishes no maximum
    pub fn max_order_size(&self) -> Decimal {
        Decimal::new(self.max_order_size, self.max_order_size_scale)
    }

    pub fn lot_size(&self) -> Decimal {
        Decimal::new(self.lot_size, self.lot_size_scale)
    }

    pub fn is_trading(&self) -> bool {
        self.status == SymbolStatus::Open
    }
}

/// 24h ticker statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub symbol: String,
    pub price_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
}

/// A public trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePrint {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    #[serde(deserialize_with = "deserialize_id")]
    pub trade_id: String,
}

/// Execution report from the trading channel
///
/// Every field but the status is optional: reports only carry what changed,
/// and rejections may arrive without an exchange order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    #[serde(rename = "orderID", default, deserialize_with = "deserialize_opt_id")]
    pub order_id: Option<String>,
    #[serde(rename = "clOrdID", default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<OrderSide>,
    #[serde(rename = "ordType", default)]
    pub ord_type: Option<OrderType>,
    #[serde(rename = "orderQty", default)]
    pub order_qty: Option<Decimal>,
    #[serde(rename = "leavesQty", default)]
    pub leaves_qty: Option<Decimal>,
    #[serde(rename = "cumQty", default)]
    pub cum_qty: Option<Decimal>,
    #[serde(rename = "avgPx", default)]
    pub avg_px: Option<Decimal>,
    #[serde(rename = "ordStatus")]
    pub ord_status: OrderStatus,
    #[serde(rename = "timeInForce", default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "execType", default)]
    pub exec_type: Option<String>,
    #[serde(rename = "execID", default, deserialize_with = "deserialize_opt_id")]
    pub exec_id: Option<String>,
    #[serde(rename = "transactTime", default, deserialize_with = "deserialize_timestamp")]
    pub transact_time: Option<DateTime<Utc>>,
    #[serde(rename = "msgType", default)]
    pub msg_type: Option<u32>,
    #[serde(rename = "lastPx", default)]
    pub last_px: Option<Decimal>,
    #[serde(rename = "lastShares", default)]
    pub last_shares: Option<Decimal>,
    #[serde(rename = "tradeId", default, deserialize_with = "deserialize_opt_id")]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(rename = "stopPx", default)]
    pub stop_px: Option<Decimal>,
}

/// Wallet balance for one currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub balance: Decimal,
    pub available: Decimal,
    #[serde(default)]
    pub balance_local: Decimal,
    #[serde(default)]
    pub available_local: Decimal,
    #[serde(default)]
    pub rate: Decimal,
}

/// Full balance state from the balances channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancesSnapshot {
    #[serde(default)]
    pub balances: Vec<Balance>,
    #[serde(default)]
    pub total_available_local: Decimal,
    #[serde(default)]
    pub total_balance_local: Decimal,
}

/// Envelope shared by every inbound message
#[derive(Debug, Deserialize)]
struct Envelope {
    seqnum: u64,
    event: ChannelEvent,
    channel: Channel,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    #[serde(default, alias = "price")]
    prices: Vec<Decimal>,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    close: Option<Decimal>,
    volume: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawSymbols {
    #[serde(default)]
    symbols: HashMap<String, SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct RawOrders {
    orders: Vec<OrderReport>,
}

impl InboundMessage {
    /// Decode a raw websocket text frame
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let payload = Self::decode_payload(&envelope)?;

        Ok(Self {
            seqnum: envelope.seqnum,
            channel: envelope.channel,
            event: envelope.event,
            symbol: envelope.symbol,
            timestamp: envelope.timestamp,
            payload,
        })
    }

    /// Channel identity this message belongs to
    pub fn channel_id(&self) -> ChannelId {
        if self.channel.requires_symbol() {
            ChannelId::new(self.channel, self.symbol.as_deref())
        } else {
            ChannelId::global(self.channel)
        }
    }

    /// Whether the message replaces state wholesale
    pub fn is_snapshot(&self) -> bool {
        self.event == ChannelEvent::Snapshot
    }

    fn decode_payload(envelope: &Envelope) -> Result<Payload> {
        let rest = Value::Object(envelope.rest.clone());

        if envelope.event.is_control() {
            let text = envelope
                .rest
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Payload::Control { text });
        }

        let symbol = envelope.symbol.clone().unwrap_or_default();
        let payload = match envelope.channel {
            Channel::Heartbeat => Payload::Heartbeat,
            Channel::L2 | Channel::L3 => {
                if envelope.symbol.is_none() {
                    return Err(FeedError::MalformedMessage(format!(
                        "{} message without symbol",
                        envelope.channel
                    )));
                }
                Payload::Book(serde_json::from_value(rest)?)
            }
            Channel::Prices => {
                let raw: RawCandle = serde_json::from_value(rest)?;
                Payload::Candle(Self::decode_candle(symbol, raw, envelope.timestamp)?)
            }
            Channel::Symbols => {
                let raw: RawSymbols = serde_json::from_value(rest)?;
                Payload::Symbols(raw.symbols)
            }
            Channel::Ticker => {
                let mut ticker: Ticker = serde_json::from_value(rest)?;
                ticker.symbol = symbol;
                Payload::Ticker(ticker)
            }
            Channel::Trades => {
                let mut trade: TradePrint = serde_json::from_value(rest)?;
                trade.symbol = symbol;
                trade.timestamp = trade.timestamp.or(envelope.timestamp);
                Payload::Trade(trade)
            }
            Channel::Trading => {
                let mut reports = if envelope.rest.contains_key("orders") {
                    let raw: RawOrders = serde_json::from_value(rest)?;
                    raw.orders
                } else if envelope.rest.contains_key("ordStatus") {
                    vec![serde_json::from_value(rest)?]
                } else {
                    return Ok(Payload::Empty);
                };
                // the envelope claims `symbol` before the report sees it
                for report in &mut reports {
                    if report.symbol.is_none() {
                        report.symbol = envelope.symbol.clone();
                    }
                }
                Payload::Orders(reports)
            }
            Channel::Balances => Payload::Balances(serde_json::from_value(rest)?),
            Channel::Auth => Payload::Empty,
        };

        Ok(payload)
    }

    fn decode_candle(
        symbol: String,
        raw: RawCandle,
        envelope_time: Option<DateTime<Utc>>,
    ) -> Result<Candle> {
        // [timestamp, open, high, low, close, volume]
        if raw.prices.len() == 6 {
            let timestamp = raw.prices[0]
                .to_i64()
                .and_then(timestamp_from_epoch)
                .or(envelope_time);
            return Ok(Candle {
                symbol,
                timestamp,
                open: raw.prices[1],
                high: raw.prices[2],
                low: raw.prices[3],
                close: raw.prices[4],
                volume: raw.prices[5],
            });
        }

        match (raw.open, raw.high, raw.low, raw.close, raw.volume) {
            (Some(open), Some(high), Some(low), Some(close), Some(volume)) => Ok(Candle {
                symbol,
                timestamp: envelope_time,
                open,
                high,
                low,
                close,
                volume,
            }),
            _ => Err(FeedError::MalformedMessage(format!(
                "prices message for {symbol} without candle data"
            ))),
        }
    }
}

/// Epoch seconds or milliseconds
fn timestamp_from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Parse RFC 3339 or the compact FIX style timestamps the trading channel uses
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y%m%d-%H:%M:%S%.f", "%Y%m%d%H%M%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Custom deserializer for timestamps sent as strings or epoch numbers
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Deserialize::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(timestamp_from_epoch)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {n}"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid timestamp: {other}"
        ))),
    }
}

/// Custom deserializer for ids the exchange sends as either strings or numbers
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}
