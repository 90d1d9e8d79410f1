//! Configuration module for the feed client

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::protocol::{Channel, ChannelId, Granularity, SubscribeParams};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Symbols to subscribe to (e.g., ["BTC-USD", "ETH-USD"])
    pub symbols: Vec<String>,

    /// Exchange websocket endpoint
    pub ws_endpoint: String,

    /// Origin header sent with the websocket handshake
    pub origin: String,

    /// API token; enables the auth, trading and balances channels
    pub api_token: Option<String>,

    /// `l2` or `l3`
    pub book_channel: Channel,

    /// Subscribe to candles when set
    pub candle_granularity: Option<Granularity>,

    pub subscription_timeout_ms: u64,

    /// Capacity of the event channel handed to the application
    pub event_buffer: usize,

    /// Order book depth levels reported in book state
    pub depth_levels: usize,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Health check interval in seconds
    pub health_check_interval_secs: u64,

    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable numbers fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let symbols: Vec<String> = lookup("SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.symbols);

        let book_channel = match lookup("BOOK_CHANNEL") {
            Some(raw) => {
                let channel = Channel::from_str(&raw).map_err(FeedError::ConfigError)?;
                if !channel.is_book() {
                    return Err(FeedError::ConfigError(format!(
                        "BOOK_CHANNEL must be l2 or l3, got {raw}"
                    )));
                }
                channel
            }
            None => defaults.book_channel,
        };

        let candle_granularity = match lookup("CANDLE_GRANULARITY") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => {
                let seconds: u32 = raw.trim().parse().map_err(|_| {
                    FeedError::ConfigError(format!("CANDLE_GRANULARITY is not a number: {raw}"))
                })?;
                Some(Granularity::from_seconds(seconds).ok_or_else(|| {
                    FeedError::ConfigError(format!("unsupported CANDLE_GRANULARITY {seconds}"))
                })?)
            }
            None => defaults.candle_granularity,
        };

        Ok(Self {
            symbols,
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            origin: lookup("WS_ORIGIN").unwrap_or(defaults.origin),
            api_token: lookup("API_TOKEN").filter(|token| !token.trim().is_empty()),
            book_channel,
            candle_granularity,
            subscription_timeout_ms: parse_or(&lookup, "SUBSCRIPTION_TIMEOUT_MS", defaults.subscription_timeout_ms),
            event_buffer: parse_or(&lookup, "EVENT_BUFFER", defaults.event_buffer).max(1),
            depth_levels: parse_or(&lookup, "DEPTH_LEVELS", defaults.depth_levels),
            reconnect_delay_ms: parse_or(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: parse_or(&lookup, "MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            health_check_interval_secs: parse_or(
                &lookup,
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            metrics_port: parse_or(&lookup, "METRICS_PORT", defaults.metrics_port),
        })
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    /// Channels to subscribe after every (re)connect
    pub fn subscriptions(&self) -> Vec<(ChannelId, SubscribeParams)> {
        let mut subscriptions = Vec::new();

        if let Some(token) = &self.api_token {
            subscriptions.push((ChannelId::global(Channel::Auth), SubscribeParams::with_token(token)));
            subscriptions.push((ChannelId::global(Channel::Trading), SubscribeParams::default()));
            subscriptions.push((ChannelId::global(Channel::Balances), SubscribeParams::default()));
        }
        subscriptions.push((ChannelId::global(Channel::Heartbeat), SubscribeParams::default()));
        subscriptions.push((ChannelId::global(Channel::Symbols), SubscribeParams::default()));

        for symbol in &self.symbols {
            subscriptions.push((
                ChannelId::symbol_scoped(self.book_channel, symbol),
                SubscribeParams::default(),
            ));
            subscriptions.push((ChannelId::symbol_scoped(Channel::Trades, symbol), SubscribeParams::default()));
            subscriptions.push((ChannelId::symbol_scoped(Channel::Ticker, symbol), SubscribeParams::default()));
            if let Some(granularity) = self.candle_granularity {
                subscriptions.push((
                    ChannelId::symbol_scoped(Channel::Prices, symbol),
                    SubscribeParams::with_granularity(granularity),
                ));
            }
        }

        subscriptions
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC-USD".to_string()],
            ws_endpoint: "wss://ws.blockchain.info/mercury-gateway/v1/ws".to_string(),
            origin: "https://exchange.blockchain.com".to_string(),
            api_token: None,
            book_channel: Channel::L2,
            candle_granularity: None,
            subscription_timeout_ms: 10_000,
            event_buffer: 1024,
            depth_levels: 20,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            health_check_interval_secs: 30,
            metrics_port: 9090,
        }
    }
}
