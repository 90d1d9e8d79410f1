//! bcx-feed - Exchange Feed Client
//!
//! Connects to the Blockchain.com Exchange websocket, keeps sequence-checked
//! order books and account state for the configured symbols, and serves
//! health and prometheus metrics over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bcx_feed::{Config, FeedEvent, FeedHandle, FeedMetrics, WebSocketManager};

/// State shared with the HTTP handlers
struct AppState {
    handle: FeedHandle,
    metrics: FeedMetrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting bcx-feed");

    let config = Arc::new(Config::load()?);
    info!(
        symbols = ?config.symbols,
        endpoint = %config.ws_endpoint,
        book_channel = %config.book_channel,
        trading = config.api_token.is_some(),
        "Configuration loaded"
    );

    let metrics = FeedMetrics::new()?;
    let (mut manager, handle, events) = WebSocketManager::new(config.clone(), metrics.clone());

    tokio::spawn(log_events(events));

    let state = Arc::new(AppState { handle, metrics });
    let port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(state, port).await {
            warn!(error = %e, "Health server error");
        }
    });

    let outcome = tokio::select! {
        result = manager.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(result) => result?,
        None => {
            info!("Shutdown signal received");
            manager.shutdown().await;
        }
    }

    Ok(())
}

/// Log the event stream; the binary has no other consumer
async fn log_events(mut events: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Subscribed { id, handle } => info!(channel = %id, handle = %handle, "Subscribed"),
            FeedEvent::Unsubscribed { id, handle } => info!(channel = %id, handle = %handle, "Unsubscribed"),
            FeedEvent::SubscriptionRejected { id, reason, .. } => {
                warn!(channel = %id, reason = %reason, "Subscription rejected")
            }
            FeedEvent::SubscriptionTimeout { id, .. } => warn!(channel = %id, "Subscription timed out"),
            FeedEvent::SequenceGap { id, expected, got } => {
                warn!(channel = %id, expected, got, "Sequence gap, resyncing")
            }
            FeedEvent::OrderChanged(order) => info!(
                order_id = ?order.order_id,
                cl_ord_id = ?order.cl_ord_id,
                status = ?order.status,
                cum_qty = %order.cum_qty,
                leaves_qty = %order.leaves_qty,
                "Order changed"
            ),
            FeedEvent::BalanceChanged(balances) => info!(currencies = balances.len(), "Balances updated"),
            FeedEvent::SymbolsUpdated(symbols) => info!(count = symbols.len(), "Symbols updated"),
            FeedEvent::Reset => warn!("Feed reset"),
            other => debug!(event = ?other, "Feed event"),
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    // The feed task does not answer while it waits to reconnect
    let feed = tokio::time::timeout(Duration::from_secs(1), state.handle.backpressure()).await;
    let (status, events) = match feed {
        Ok(Ok(pressure)) => (
            if pressure.is_saturated() { "degraded" } else { "healthy" },
            serde_json::json!({
                "available": pressure.available,
                "capacity": pressure.capacity,
                "dropped": pressure.dropped,
            }),
        ),
        _ => ("unavailable", serde_json::Value::Null),
    };

    Json(serde_json::json!({
        "status": status,
        "component": "bcx-feed",
        "events": events,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
