//! WebSocket connection manager
//!
//! Owns the coordinator and the connection. A single task reads frames,
//! writes outbound requests, runs handle commands and ticks timeouts, so the
//! coordinator never needs a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use super::handle::{Command, FeedHandle};
use super::WebSocketClient;
use crate::config::Config;
use crate::coordinator::{FeedCoordinator, FeedEvent};
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::protocol::OutboundRequest;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
const KEEPALIVE_SECS: u64 = 30;
const RECV_TIMEOUT_SECS: u64 = 45;
const TICK_MS: u64 = 250;
const COMMAND_BUFFER: usize = 256;

/// Manages WebSocket connections with automatic reconnection
pub struct WebSocketManager {
    config: Arc<Config>,
    client: WebSocketClient,
    coordinator: FeedCoordinator,
    outbound_rx: mpsc::UnboundedReceiver<OutboundRequest>,
    command_rx: mpsc::Receiver<Command>,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl WebSocketManager {
    /// Build the manager with the handle and event stream the application uses
    pub fn new(config: Arc<Config>, metrics: FeedMetrics) -> (Self, FeedHandle, mpsc::Receiver<FeedEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let coordinator = FeedCoordinator::new(&config, outbound_tx, event_tx, metrics);
        let client = WebSocketClient::new(&config.ws_endpoint, &config.origin);

        let manager = Self {
            config,
            client,
            coordinator,
            outbound_rx,
            command_rx,
            reconnect_attempts: 0,
            last_successful_connection: None,
        };
        (manager, FeedHandle::new(command_tx), event_rx)
    }

    /// Run the WebSocket manager - runs indefinitely with automatic reconnection
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting WebSocket manager with infinite retry");

        loop {
            // Reset reconnect attempts if we've been stable for a while
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            let result = self.connect_and_process().await;
            self.client.close().await;
            self.coordinator.on_disconnect();
            self.discard_outbound();

            match result {
                Ok(()) => {
                    info!("WebSocket processing completed normally, reconnecting...");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!(error = %e, "WebSocket error");
                    self.reconnect_attempts += 1;

                    if self.config.max_reconnect_attempts > 0
                        && self.reconnect_attempts > self.config.max_reconnect_attempts
                    {
                        warn!(
                            attempts = self.reconnect_attempts,
                            max = self.config.max_reconnect_attempts,
                            "Reconnect attempts above configured maximum, continuing at capped backoff"
                        );
                    }

                    let base_delay = self.config.reconnect_delay_ms
                        * 2u64.pow(self.reconnect_attempts.min(6));
                    let delay = Duration::from_millis(base_delay.min(MAX_BACKOFF_MS));

                    warn!(
                        attempt = self.reconnect_attempts,
                        delay_secs = delay.as_secs(),
                        "Reconnecting after error..."
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Connect and process messages
    async fn connect_and_process(&mut self) -> Result<()> {
        self.client.connect().await?;

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;
        info!("WebSocket connected successfully, resetting reconnect counter");

        self.discard_outbound();
        for (id, params) in self.config.subscriptions() {
            if let Err(e) = self.coordinator.subscribe_with(id.clone(), params, Instant::now()) {
                warn!(channel = %id, error = %e, "Failed to subscribe");
            }
        }

        let mut ticker = interval(Duration::from_millis(TICK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut keepalive = Keepalive::new(
            Instant::now(),
            Duration::from_secs(KEEPALIVE_SECS),
            Duration::from_secs(RECV_TIMEOUT_SECS),
        );

        loop {
            tokio::select! {
                frame = self.client.recv() => match frame? {
                    Some(text) => {
                        let now = Instant::now();
                        keepalive.seen(now);
                        self.coordinator.handle_raw(&text, now);
                    }
                    None => keepalive.seen(Instant::now()),
                },
                Some(request) = self.outbound_rx.recv() => self.write(request).await?,
                Some(command) = self.command_rx.recv() => command.apply(&mut self.coordinator, Instant::now()),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.coordinator.tick(now);
                    match keepalive.poll(now) {
                        KeepaliveAction::Idle => {}
                        KeepaliveAction::Ping => {
                            if let Err(e) = self.client.ping().await {
                                warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                                return Err(FeedError::ConnectionTimeout);
                            }
                        }
                        KeepaliveAction::Expired => {
                            warn!(
                                silent_secs = keepalive.silent_for(now).as_secs(),
                                "Keepalive ping unanswered, reconnecting"
                            );
                            return Err(FeedError::ConnectionTimeout);
                        }
                    }
                }
                _ = status.tick() => self.log_status(),
            }
        }
    }

    async fn write(&mut self, request: OutboundRequest) -> Result<()> {
        match request.to_json() {
            Ok(text) => self.client.send_text(text).await,
            Err(e) => {
                error!(error = %e, request = ?request, "Failed to encode request");
                Ok(())
            }
        }
    }

    /// Requests queued before a reset refer to state that no longer exists
    fn discard_outbound(&mut self) {
        let mut discarded = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarded outbound requests after reset");
        }
    }

    fn log_status(&self) {
        for symbol in &self.config.symbols {
            if let Some(state) = self.coordinator.book_state(symbol) {
                if let Some(mid) = state.metrics.mid_price {
                    info!(
                        symbol = %symbol,
                        mid_price = %mid,
                        spread_bps = ?state.metrics.spread_bps,
                        imbalance = ?state.metrics.imbalance,
                        stale = state.stale,
                        "Order book status"
                    );
                }
            }
        }

        let pressure = self.coordinator.backpressure();
        if pressure.is_saturated() || pressure.dropped > 0 {
            warn!(
                available = pressure.available,
                capacity = pressure.capacity,
                dropped = pressure.dropped,
                "Event consumer falling behind"
            );
        }
    }

    /// Unsubscribe everything, flush the requests and close the socket
    pub async fn shutdown(&mut self) {
        if self.client.is_connected() {
            if let Err(e) = self.coordinator.shutdown(Instant::now()) {
                warn!(error = %e, "Failed to queue unsubscribe requests");
            }
            while let Ok(request) = self.outbound_rx.try_recv() {
                if let Err(e) = self.write(request).await {
                    warn!(error = %e, "Failed to send request during shutdown");
                    break;
                }
            }
        }
        self.client.close().await;
        info!("WebSocket manager stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepaliveAction {
    Idle,
    Ping,
    Expired,
}

/// Connection liveness, tracked across loop iterations
///
/// Any frame counts as traffic, control frames included. After `idle` of
/// silence one ping goes out; silence past `deadline` ends the connection.
#[derive(Debug)]
struct Keepalive {
    last_seen: Instant,
    ping_sent: bool,
    idle: Duration,
    deadline: Duration,
}

impl Keepalive {
    fn new(now: Instant, idle: Duration, deadline: Duration) -> Self {
        Self { last_seen: now, ping_sent: false, idle, deadline }
    }

    fn seen(&mut self, now: Instant) {
        self.last_seen = now;
        self.ping_sent = false;
    }

    fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    fn poll(&mut self, now: Instant) -> KeepaliveAction {
        let silent = self.silent_for(now);
        if silent >= self.deadline && self.ping_sent {
            KeepaliveAction::Expired
        } else if silent >= self.idle && !self.ping_sent {
            self.ping_sent = true;
            KeepaliveAction::Ping
        } else {
            KeepaliveAction::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(start: Instant) -> Keepalive {
        Keepalive::new(start, Duration::from_secs(KEEPALIVE_SECS), Duration::from_secs(RECV_TIMEOUT_SECS))
    }

    #[test]
    fn test_silence_pings_once_then_expires() {
        let start = Instant::now();
        let mut keepalive = keepalive(start);

        assert_eq!(keepalive.poll(start + Duration::from_secs(10)), KeepaliveAction::Idle);
        assert_eq!(keepalive.poll(start + Duration::from_secs(30)), KeepaliveAction::Ping);
        assert_eq!(keepalive.poll(start + Duration::from_secs(31)), KeepaliveAction::Idle);
        assert_eq!(keepalive.poll(start + Duration::from_secs(45)), KeepaliveAction::Expired);
    }

    #[test]
    fn test_deadline_survives_frequent_ticks() {
        let start = Instant::now();
        let mut keepalive = keepalive(start);

        let mut actions = Vec::new();
        let mut at = start;
        while at < start + Duration::from_secs(50) {
            at += Duration::from_millis(TICK_MS);
            let action = keepalive.poll(at);
            if action != KeepaliveAction::Idle {
                actions.push(action);
            }
            if action == KeepaliveAction::Expired {
                break;
            }
        }

        assert_eq!(actions, vec![KeepaliveAction::Ping, KeepaliveAction::Expired]);
    }

    #[test]
    fn test_any_frame_rearms_keepalive() {
        let start = Instant::now();
        let mut keepalive = keepalive(start);

        assert_eq!(keepalive.poll(start + Duration::from_secs(30)), KeepaliveAction::Ping);
        // pong arrives
        keepalive.seen(start + Duration::from_secs(32));

        assert_eq!(keepalive.poll(start + Duration::from_secs(50)), KeepaliveAction::Idle);
        assert_eq!(keepalive.poll(start + Duration::from_secs(62)), KeepaliveAction::Ping);
        assert_eq!(keepalive.silent_for(start + Duration::from_secs(62)), Duration::from_secs(30));
    }
}
