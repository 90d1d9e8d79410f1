//! Wire vocabulary of the exchange websocket feed
//!
//! Every message on the connection is tagged with a channel and an event.
//! Inbound messages are decoded once here into typed variants; outbound
//! requests are serialized to the exchange JSON format.

mod inbound;
mod outbound;

pub use inbound::{
    Balance, BalancesSnapshot, BookLevels, Candle, InboundMessage, OrderReport, Payload,
    PriceLevel, SymbolInfo, SymbolStatus, Ticker, TradePrint,
};
pub use outbound::{
    CancelOrderRequest, ChannelRequest, ExecInst, NewOrderSingle, OrderCreationRequest,
    OrderKind, OutboundRequest, SubscribeParams, MAX_CL_ORD_ID_LEN,
};

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Feed channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Auth,
    Balances,
    Heartbeat,
    L2,
    L3,
    Prices,
    Symbols,
    Ticker,
    Trades,
    Trading,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Auth => "auth",
            Channel::Balances => "balances",
            Channel::Heartbeat => "heartbeat",
            Channel::L2 => "l2",
            Channel::L3 => "l3",
            Channel::Prices => "prices",
            Channel::Symbols => "symbols",
            Channel::Ticker => "ticker",
            Channel::Trades => "trades",
            Channel::Trading => "trading",
        }
    }

    /// Whether subscriptions to this channel are scoped to one symbol
    pub fn requires_symbol(&self) -> bool {
        matches!(
            self,
            Channel::L2 | Channel::L3 | Channel::Prices | Channel::Ticker | Channel::Trades
        )
    }

    /// Whether the channel carries order book levels
    pub fn is_book(&self) -> bool {
        matches!(self, Channel::L2 | Channel::L3)
    }

    /// Whether subscribing needs an auth token on the request
    pub fn requires_token(&self) -> bool {
        matches!(self, Channel::Auth)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auth" => Ok(Channel::Auth),
            "balances" => Ok(Channel::Balances),
            "heartbeat" => Ok(Channel::Heartbeat),
            "l2" => Ok(Channel::L2),
            "l3" => Ok(Channel::L3),
            "prices" => Ok(Channel::Prices),
            "symbols" => Ok(Channel::Symbols),
            "ticker" => Ok(Channel::Ticker),
            "trades" => Ok(Channel::Trades),
            "trading" => Ok(Channel::Trading),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Events a channel can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEvent {
    Subscribed,
    Unsubscribed,
    Rejected,
    Snapshot,
    Updated,
}

impl ChannelEvent {
    /// Subscription control events bypass the sequencer
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Subscribed | ChannelEvent::Unsubscribed | ChannelEvent::Rejected
        )
    }
}

/// Order and trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "limit")]
    Limit,
    #[serde(rename = "market")]
    Market,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "stopLimit")]
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Statuses after which the exchange sends no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    GoodTillCancel,
    #[serde(rename = "GTD")]
    GoodTillDate,
    #[serde(rename = "FOK")]
    FillOrKill,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
}

/// Candle width accepted by the prices channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    SixHours,
    OneDay,
}

impl Granularity {
    pub fn seconds(&self) -> u32 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::OneHour => 3600,
            Granularity::SixHours => 21600,
            Granularity::OneDay => 86400,
        }
    }

    pub fn from_seconds(seconds: u32) -> Option<Self> {
        match seconds {
            60 => Some(Granularity::OneMinute),
            300 => Some(Granularity::FiveMinutes),
            900 => Some(Granularity::FifteenMinutes),
            3600 => Some(Granularity::OneHour),
            21600 => Some(Granularity::SixHours),
            86400 => Some(Granularity::OneDay),
            _ => None,
        }
    }
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.seconds())
    }
}

/// The subscription unit: a channel, optionally scoped to one symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub channel: Channel,
    pub symbol: Option<String>,
}

impl ChannelId {
    pub fn new(channel: Channel, symbol: Option<&str>) -> Self {
        Self {
            channel,
            symbol: symbol.map(str::to_string),
        }
    }

    /// Identity of an account-wide or global channel
    pub fn global(channel: Channel) -> Self {
        Self {
            channel,
            symbol: None,
        }
    }

    pub fn symbol_scoped(channel: Channel, symbol: &str) -> Self {
        Self {
            channel,
            symbol: Some(symbol.to_string()),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{}:{}", self.channel, symbol),
            None => write!(f, "{}", self.channel),
        }
    }
}
