//! Async handle to a running feed
//!
//! Every call becomes a command executed by the task that owns the
//! coordinator, so calls from any number of tasks are serialized with the
//! inbound stream.

use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::coordinator::{Backpressure, FeedCoordinator};
use crate::error::{FeedError, Result};
use crate::orderbook::{OrderBookState, PriceLevel, Side};
use crate::orders::{Order, OrderHandle};
use crate::protocol::{Balance, Channel, ChannelId, OrderCreationRequest, SubscribeParams};
use crate::subscription::SubscriptionHandle;

pub(crate) enum Command {
    Subscribe {
        id: ChannelId,
        params: SubscribeParams,
        reply: oneshot::Sender<Result<SubscriptionHandle>>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    PlaceOrder {
        request: OrderCreationRequest,
        reply: oneshot::Sender<Result<OrderHandle>>,
    },
    CancelOrder {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Best {
        symbol: String,
        side: Side,
        reply: oneshot::Sender<Option<PriceLevel>>,
    },
    Depth {
        symbol: String,
        side: Side,
        levels: usize,
        reply: oneshot::Sender<Vec<PriceLevel>>,
    },
    BookState {
        symbol: String,
        reply: oneshot::Sender<Option<OrderBookState>>,
    },
    GetOrder {
        id: String,
        reply: oneshot::Sender<Option<Order>>,
    },
    GetBalance {
        currency: String,
        reply: oneshot::Sender<Option<Balance>>,
    },
    Backpressure {
        reply: oneshot::Sender<Backpressure>,
    },
}

impl Command {
    /// Run against the coordinator; a caller that went away is not an error
    pub(crate) fn apply(self, feed: &mut FeedCoordinator, now: Instant) {
        match self {
            Command::Subscribe { id, params, reply } => {
                let _ = reply.send(feed.subscribe_with(id, params, now));
            }
            Command::Unsubscribe { handle, reply } => {
                let _ = reply.send(feed.unsubscribe(handle, now));
            }
            Command::PlaceOrder { request, reply } => {
                let _ = reply.send(feed.place_order(request));
            }
            Command::CancelOrder { id, reply } => {
                let _ = reply.send(feed.cancel_order(&id));
            }
            Command::Best {
                symbol,
                side,
                reply,
            } => {
                let _ = reply.send(feed.best(&symbol, side));
            }
            Command::Depth {
                symbol,
                side,
                levels,
                reply,
            } => {
                let _ = reply.send(feed.depth(&symbol, side, levels));
            }
            Command::BookState { symbol, reply } => {
                let _ = reply.send(feed.book_state(&symbol));
            }
            Command::GetOrder { id, reply } => {
                let _ = reply.send(feed.get_order(&id).cloned());
            }
            Command::GetBalance { currency, reply } => {
                let _ = reply.send(feed.get_balance(&currency).cloned());
            }
            Command::Backpressure { reply } => {
                let _ = reply.send(feed.backpressure());
            }
        }
    }
}

/// Cloneable entry point for application tasks
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<Command>,
}

impl FeedHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| FeedError::TransportClosed)?;
        response.await.map_err(|_| FeedError::TransportClosed)
    }

    pub async fn subscribe(&self, channel: Channel, symbol: Option<&str>) -> Result<SubscriptionHandle> {
        self.subscribe_with(ChannelId::new(channel, symbol), SubscribeParams::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        id: ChannelId,
        params: SubscribeParams,
    ) -> Result<SubscriptionHandle> {
        self.request(|reply| Command::Subscribe { id, params, reply })
            .await?
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.request(|reply| Command::Unsubscribe { handle, reply })
            .await?
    }

    pub async fn place_order(&self, request: OrderCreationRequest) -> Result<OrderHandle> {
        self.request(|reply| Command::PlaceOrder { request, reply })
            .await?
    }

    pub async fn cancel_order(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::CancelOrder { id, reply }).await?
    }

    pub async fn best(&self, symbol: &str, side: Side) -> Result<Option<PriceLevel>> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::Best {
            symbol,
            side,
            reply,
        })
        .await
    }

    pub async fn depth(&self, symbol: &str, side: Side, levels: usize) -> Result<Vec<PriceLevel>> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::Depth {
            symbol,
            side,
            levels,
            reply,
        })
        .await
    }

    pub async fn book_state(&self, symbol: &str) -> Result<Option<OrderBookState>> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::BookState { symbol, reply })
            .await
    }

    pub async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let id = id.to_string();
        self.request(|reply| Command::GetOrder { id, reply }).await
    }

    pub async fn get_balance(&self, currency: &str) -> Result<Option<Balance>> {
        let currency = currency.to_string();
        self.request(|reply| Command::GetBalance { currency, reply })
            .await
    }

    pub async fn backpressure(&self) -> Result<Backpressure> {
        self.request(|reply| Command::Backpressure { reply }).await
    }
}
