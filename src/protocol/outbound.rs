//! Outbound requests
//!
//! Order creation is modelled as shared fields plus an `OrderKind` carrying
//! the per-type fields, flattened into one JSON object on the wire.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use super::{Channel, ChannelId, Granularity, OrderSide, OrderType, TimeInForce};
use crate::error::{FeedError, Result};

/// Longest client order id the exchange accepts
pub const MAX_CL_ORD_ID_LEN: usize = 20;

/// Extra subscription parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeParams {
    /// Candle width, required by the prices channel
    pub granularity: Option<Granularity>,
    /// Session token, required by the auth channel
    pub token: Option<String>,
}

impl SubscribeParams {
    pub fn with_granularity(granularity: Granularity) -> Self {
        Self {
            granularity: Some(granularity),
            token: None,
        }
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            granularity: None,
            token: Some(token.to_string()),
        }
    }
}

/// Body of a subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelRequest {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Execution instruction for limit orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecInst {
    /// Add liquidity only (post-only)
    #[serde(rename = "ALO")]
    AddLiquidityOnly,
}

/// Per-type order fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "ordType")]
pub enum OrderKind {
    #[serde(rename = "market")]
    Market {
        #[serde(rename = "timeInForce", skip_serializing_if = "Option::is_none")]
        time_in_force: Option<TimeInForce>,
        #[serde(
            rename = "minQty",
            skip_serializing_if = "Option::is_none",
            with = "rust_decimal::serde::float_option"
        )]
        min_qty: Option<Decimal>,
    },
    #[serde(rename = "limit")]
    Limit {
        #[serde(with = "rust_decimal::serde::float")]
        price: Decimal,
        #[serde(rename = "timeInForce")]
        time_in_force: TimeInForce,
        #[serde(rename = "execInst", skip_serializing_if = "Option::is_none")]
        exec_inst: Option<ExecInst>,
        #[serde(
            rename = "expireDate",
            skip_serializing_if = "Option::is_none",
            serialize_with = "serialize_expire_date"
        )]
        expire_date: Option<NaiveDate>,
        #[serde(
            rename = "minQty",
            skip_serializing_if = "Option::is_none",
            with = "rust_decimal::serde::float_option"
        )]
        min_qty: Option<Decimal>,
    },
    #[serde(rename = "stop")]
    Stop {
        #[serde(rename = "timeInForce")]
        time_in_force: TimeInForce,
        #[serde(rename = "stopPx", with = "rust_decimal::serde::float")]
        stop_px: Decimal,
    },
    #[serde(rename = "stopLimit")]
    StopLimit {
        #[serde(rename = "timeInForce")]
        time_in_force: TimeInForce,
        #[serde(with = "rust_decimal::serde::float")]
        price: Decimal,
        #[serde(rename = "stopPx", with = "rust_decimal::serde::float")]
        stop_px: Decimal,
    },
}

/// A new order, before the exchange has seen it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderCreationRequest {
    /// Generated on submission when left empty
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "orderQty", with = "rust_decimal::serde::float")]
    pub order_qty: Decimal,
    #[serde(flatten)]
    pub kind: OrderKind,
}

impl OrderCreationRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(
            symbol,
            side,
            quantity,
            OrderKind::Market {
                time_in_force: None,
                min_qty: None,
            },
        )
    }

    pub fn limit(
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self::new(
            symbol,
            side,
            quantity,
            OrderKind::Limit {
                price,
                time_in_force,
                exec_inst: None,
                expire_date: None,
                min_qty: None,
            },
        )
    }

    pub fn stop(
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_px: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self::new(
            symbol,
            side,
            quantity,
            OrderKind::Stop {
                time_in_force,
                stop_px,
            },
        )
    }

    pub fn stop_limit(
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_px: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self::new(
            symbol,
            side,
            quantity,
            OrderKind::StopLimit {
                time_in_force,
                price,
                stop_px,
            },
        )
    }

    fn new(symbol: &str, side: OrderSide, quantity: Decimal, kind: OrderKind) -> Self {
        Self {
            cl_ord_id: String::new(),
            symbol: symbol.to_string(),
            side,
            order_qty: quantity,
            kind,
        }
    }

    pub fn with_cl_ord_id(mut self, cl_ord_id: &str) -> Self {
        self.cl_ord_id = cl_ord_id.to_string();
        self
    }

    pub fn order_type(&self) -> OrderType {
        match self.kind {
            OrderKind::Market { .. } => OrderType::Market,
            OrderKind::Limit { .. } => OrderType::Limit,
            OrderKind::Stop { .. } => OrderType::Stop,
            OrderKind::StopLimit { .. } => OrderType::StopLimit,
        }
    }

    /// Limit price, if the order type has one
    pub fn price(&self) -> Option<Decimal> {
        match self.kind {
            OrderKind::Limit { price, .. } | OrderKind::StopLimit { price, .. } => Some(price),
            _ => None,
        }
    }

    pub fn time_in_force(&self) -> Option<TimeInForce> {
        match self.kind {
            OrderKind::Market { time_in_force, .. } => time_in_force,
            OrderKind::Limit { time_in_force, .. }
            | OrderKind::Stop { time_in_force, .. }
            | OrderKind::StopLimit { time_in_force, .. } => Some(time_in_force),
        }
    }

    /// Check the request locally before it is sent
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(FeedError::InvalidOrder("missing symbol".to_string()));
        }
        if self.order_qty <= Decimal::ZERO {
            return Err(FeedError::InvalidOrder(format!(
                "order quantity must be positive, got {}",
                self.order_qty
            )));
        }
        if self.cl_ord_id.len() > MAX_CL_ORD_ID_LEN {
            return Err(FeedError::InvalidOrder(format!(
                "clOrdID longer than {MAX_CL_ORD_ID_LEN} characters"
            )));
        }
        if let Some(price) = self.price() {
            if price <= Decimal::ZERO {
                return Err(FeedError::InvalidOrder(format!(
                    "price must be positive, got {price}"
                )));
            }
        }
        match &self.kind {
            OrderKind::Stop { stop_px, .. } | OrderKind::StopLimit { stop_px, .. }
                if *stop_px <= Decimal::ZERO =>
            {
                Err(FeedError::InvalidOrder(format!(
                    "stop price must be positive, got {stop_px}"
                )))
            }
            OrderKind::Limit {
                time_in_force: TimeInForce::GoodTillDate,
                expire_date: None,
                ..
            } => Err(FeedError::InvalidOrder(
                "GTD limit order needs an expire date".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// NewOrderSingle on the trading channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrderSingle {
    pub channel: Channel,
    #[serde(flatten)]
    pub order: OrderCreationRequest,
}

/// CancelOrderRequest on the trading channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOrderRequest {
    pub channel: Channel,
    #[serde(rename = "orderID")]
    pub order_id: String,
}

/// Everything the client sends to the exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum OutboundRequest {
    #[serde(rename = "subscribe")]
    Subscribe(ChannelRequest),
    #[serde(rename = "unsubscribe")]
    Unsubscribe(ChannelRequest),
    NewOrderSingle(NewOrderSingle),
    CancelOrderRequest(CancelOrderRequest),
}

impl OutboundRequest {
    pub fn subscribe(id: &ChannelId, params: &SubscribeParams) -> Self {
        OutboundRequest::Subscribe(ChannelRequest {
            channel: id.channel,
            symbol: id.symbol.clone(),
            granularity: params.granularity,
            token: params.token.clone(),
        })
    }

    /// The token is only sent when subscribing
    pub fn unsubscribe(id: &ChannelId, params: &SubscribeParams) -> Self {
        OutboundRequest::Unsubscribe(ChannelRequest {
            channel: id.channel,
            symbol: id.symbol.clone(),
            granularity: params.granularity,
            token: None,
        })
    }

    pub fn new_order(order: OrderCreationRequest) -> Self {
        OutboundRequest::NewOrderSingle(NewOrderSingle {
            channel: Channel::Trading,
            order,
        })
    }

    pub fn cancel(order_id: &str) -> Self {
        OutboundRequest::CancelOrderRequest(CancelOrderRequest {
            channel: Channel::Trading,
            order_id: order_id.to_string(),
        })
    }

    /// Encode as a websocket text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The exchange expects expire dates as YYYYMMDD integers
fn serialize_expire_date<S>(date: &Option<NaiveDate>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match date {
        Some(date) => {
            let value = date.year() as u32 * 10_000 + date.month() * 100 + date.day();
            serializer.serialize_u32(value)
        }
        None => serializer.serialize_none(),
    }
}
