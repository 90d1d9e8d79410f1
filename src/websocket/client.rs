//! WebSocket client for the exchange feed
//!
//! One connection carries every channel; this type only moves text frames.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
    origin: String,
}

impl WebSocketClient {
    pub fn new(endpoint: &str, origin: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
            origin: origin.to_string(),
        }
    }

    /// Connect to the WebSocket endpoint
    ///
    /// The exchange refuses handshakes without an Origin header.
    pub async fn connect(&mut self) -> Result<()> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|e| FeedError::WebSocketConnection(format!("Invalid origin: {e}")))?;
        request.headers_mut().insert("Origin", origin);

        info!(url = %self.endpoint, "Connecting to exchange WebSocket");

        let (ws_stream, response) = connect_async(request).await.map_err(|e| {
            FeedError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Receive the next text frame; control frames yield `None`
    ///
    /// Any close, stream error or end of stream drops the connection.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::WebSocketConnection("Not connected".to_string()))?;

        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(self.lost(FeedError::WebSocketMessage(e.to_string()))),
            None => {
                return Err(self.lost(FeedError::WebSocketConnection(
                    "Stream ended".to_string(),
                )))
            }
        };

        match message {
            Message::Text(text) => Ok(Some(text)),
            Message::Binary(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Message::Ping(data) => {
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|frame| format!("Closed by peer: {} {}", frame.code, frame.reason))
                    .unwrap_or_else(|| "Closed by peer".to_string());
                Err(self.lost(FeedError::WebSocketConnection(reason)))
            }
            Message::Pong(_) | Message::Frame(_) => Ok(None),
        }
    }

    fn lost(&mut self, error: FeedError) -> FeedError {
        warn!(error = %error, "WebSocket connection lost");
        self.stream = None;
        error
    }

    pub async fn send_text(&mut self, text: String) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(FeedError::TransportClosed)?;
        debug!(len = text.len(), "Sending text message");
        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::WebSocketMessage(e.to_string()))
    }

    /// Send a ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| FeedError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "Error while closing WebSocket");
            }
        }
    }
}
