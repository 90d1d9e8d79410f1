//! bcx-feed - Exchange Feed Client Library
//!
//! Multiplexed market data and trading client for the Blockchain.com Exchange
//! websocket API. Channel subscriptions, sequence-checked order book
//! reconstruction, order tracking and balances are composed by a
//! [`FeedCoordinator`] that publishes one ordered event stream.

pub mod balances;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod orderbook;
pub mod orders;
pub mod protocol;
pub mod sequencer;
pub mod subscription;
pub mod symbols;
pub mod websocket;

pub use balances::BalanceLedger;
pub use config::Config;
pub use coordinator::{Backpressure, FeedCoordinator, FeedEvent};
pub use error::{FeedError, Result};
pub use metrics::FeedMetrics;
pub use orderbook::{BookManager, OrderBook, OrderBookMetrics, OrderBookState, Side};
pub use orders::{Order, OrderHandle, OrderTracker};
pub use protocol::{Channel, ChannelId, InboundMessage, OrderCreationRequest, OutboundRequest};
pub use sequencer::{SequenceOutcome, Sequencer};
pub use subscription::{SubscriptionHandle, SubscriptionManager, SubscriptionState};
pub use symbols::SymbolRegistry;
pub use websocket::{FeedHandle, WebSocketManager};
