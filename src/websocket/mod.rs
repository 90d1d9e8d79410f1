//! WebSocket transport: connection, reconnect loop and the async handle

mod client;
mod handle;
mod manager;

pub use client::WebSocketClient;
pub use handle::FeedHandle;
pub use manager::WebSocketManager;
