//! Prometheus counters for the feed
//!
//! Each coordinator gets its own registry so several feeds (and tests) can run
//! in one process without colliding on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{FeedError, Result};

#[derive(Clone)]
pub struct FeedMetrics {
    registry: Registry,
    pub messages: IntCounterVec,
    pub duplicates: IntCounter,
    pub gaps: IntCounterVec,
    pub resyncs: IntCounter,
    pub malformed: IntCounter,
    pub no_baseline: IntCounter,
    pub ignored_order_reports: IntCounter,
    pub dropped_events: IntCounter,
    pub subscription_timeouts: IntCounter,
}

impl FeedMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages = IntCounterVec::new(
            Opts::new("feed_messages_total", "Inbound messages by channel"),
            &["channel"],
        )?;
        let gaps = IntCounterVec::new(
            Opts::new("feed_gaps_total", "Sequence gaps detected by channel"),
            &["channel"],
        )?;
        let duplicates = IntCounter::new("feed_duplicates_total", "Duplicate messages dropped")?;
        let resyncs = IntCounter::new("feed_resyncs_total", "Resync cycles started")?;
        let malformed = IntCounter::new("feed_malformed_total", "Undecodable messages dropped")?;
        let no_baseline = IntCounter::new(
            "feed_no_baseline_total",
            "Book deltas dropped for lack of a snapshot",
        )?;
        let ignored_order_reports = IntCounter::new(
            "feed_ignored_order_reports_total",
            "Stale or late order reports ignored",
        )?;
        let dropped_events = IntCounter::new(
            "feed_dropped_events_total",
            "Events dropped because the consumer fell behind",
        )?;
        let subscription_timeouts = IntCounter::new(
            "feed_subscription_timeouts_total",
            "Subscription requests that were never confirmed",
        )?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(gaps.clone()))?;
        registry.register(Box::new(duplicates.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(malformed.clone()))?;
        registry.register(Box::new(no_baseline.clone()))?;
        registry.register(Box::new(ignored_order_reports.clone()))?;
        registry.register(Box::new(dropped_events.clone()))?;
        registry.register(Box::new(subscription_timeouts.clone()))?;

        Ok(Self {
            registry,
            messages,
            duplicates,
            gaps,
            resyncs,
            malformed,
            no_baseline,
            ignored_order_reports,
            dropped_events,
            subscription_timeouts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| FeedError::MetricsError(e.to_string()))
    }
}

impl std::fmt::Debug for FeedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedMetrics")
            .field("duplicates", &self.duplicates.get())
            .field("resyncs", &self.resyncs.get())
            .field("malformed", &self.malformed.get())
            .field("dropped_events", &self.dropped_events.get())
            .finish_non_exhaustive()
    }
}
