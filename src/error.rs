//! Error types for the feed client

use thiserror::Error;

/// Feed client errors
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Sequence gap on {channel}: expected {expected}, got {got}")]
    SequenceGap {
        channel: String,
        expected: u64,
        got: u64,
    },

    #[error("No snapshot baseline for {0}")]
    NoBaseline(String),

    #[error("Subscription to {channel} rejected: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    #[error("Subscription to {0} timed out")]
    SubscriptionTimeout(String),

    #[error("Unknown or late order report: {0}")]
    UnknownOrderReport(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Duplicate client order id: {0}")]
    DuplicateClientOrderId(String),

    #[error("Order {0} has not been acknowledged by the exchange")]
    OrderNotAcknowledged(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::MalformedMessage(err.to_string())
    }
}

impl From<prometheus::Error> for FeedError {
    fn from(err: prometheus::Error) -> Self {
        FeedError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
