//! Channel subscription state machine
//!
//! ```text
//! Idle --subscribe--> Subscribing --subscribed--> Subscribed
//! Subscribing --rejected / timeout--> Idle
//! Subscribed --unsubscribe--> Unsubscribing --unsubscribed--> Idle
//! Subscribed --gap--> Unsubscribing --unsubscribed--> Subscribing   (resync)
//! any --disconnect--> Idle
//! ```
//!
//! Idle identities have no record. Requests the transitions produce are
//! queued and drained by the coordinator.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::protocol::{Channel, ChannelId, OutboundRequest, SubscribeParams};

/// Caller-facing token for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: ChannelId,
    pub state: SubscriptionState,
    pub handle: SubscriptionHandle,
    pub params: SubscribeParams,
    deadline: Option<Instant>,
    /// Subscribe again once the pending unsubscribe confirms
    resubscribe: bool,
}

impl SubscriptionRecord {
    pub fn is_resyncing(&self) -> bool {
        self.state == SubscriptionState::Unsubscribing && self.resubscribe
    }
}

/// What an `unsubscribed` confirmation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Idle(SubscriptionHandle),
    Resubscribing(SubscriptionHandle),
    Ignored,
}

/// A request that was not confirmed in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub id: ChannelId,
    pub handle: SubscriptionHandle,
    /// Subscribing or Unsubscribing
    pub state: SubscriptionState,
}

#[derive(Debug)]
pub struct SubscriptionManager {
    records: HashMap<ChannelId, SubscriptionRecord>,
    next_handle: u64,
    timeout: Duration,
    outbox: Vec<OutboundRequest>,
}

impl SubscriptionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            next_handle: 1,
            timeout,
            outbox: Vec::new(),
        }
    }

    /// Request a subscription; idempotent per identity
    pub fn subscribe(
        &mut self,
        id: &ChannelId,
        params: SubscribeParams,
        now: Instant,
    ) -> Result<SubscriptionHandle> {
        Self::validate(id, &params)?;

        if let Some(record) = self.records.get_mut(id) {
            match record.state {
                SubscriptionState::Subscribing | SubscriptionState::Subscribed => {
                    debug!(channel = %id, handle = %record.handle, "Already subscribing or subscribed");
                }
                SubscriptionState::Unsubscribing => {
                    debug!(channel = %id, "Subscribe queued behind pending unsubscribe");
                    record.resubscribe = true;
                    record.params = params;
                }
                SubscriptionState::Idle => {}
            }
            return Ok(record.handle);
        }

        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;

        info!(channel = %id, handle = %handle, "Subscribing");
        self.outbox.push(OutboundRequest::subscribe(id, &params));
        self.records.insert(
            id.clone(),
            SubscriptionRecord {
                id: id.clone(),
                state: SubscriptionState::Subscribing,
                handle,
                params,
                deadline: Some(now + self.timeout),
                resubscribe: false,
            },
        );

        Ok(handle)
    }

    /// Cancel a subscription, including one still waiting for confirmation
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle, now: Instant) -> Result<()> {
        let id = self
            .records
            .values()
            .find(|record| record.handle == handle)
            .map(|record| record.id.clone())
            .ok_or_else(|| FeedError::NotSubscribed(handle.to_string()))?;
        self.unsubscribe_id(&id, now)
    }

    pub fn unsubscribe_id(&mut self, id: &ChannelId, now: Instant) -> Result<()> {
        let timeout = self.timeout;
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| FeedError::NotSubscribed(id.to_string()))?;

        match record.state {
            SubscriptionState::Subscribing | SubscriptionState::Subscribed => {
                info!(channel = %id, handle = %record.handle, "Unsubscribing");
                record.state = SubscriptionState::Unsubscribing;
                record.resubscribe = false;
                record.deadline = Some(now + timeout);
                self.outbox
                    .push(OutboundRequest::unsubscribe(id, &record.params));
            }
            SubscriptionState::Unsubscribing => {
                record.resubscribe = false;
            }
            SubscriptionState::Idle => {}
        }
        Ok(())
    }

    /// Exchange confirmed a subscribe
    pub fn on_subscribed(&mut self, id: &ChannelId) -> Option<SubscriptionHandle> {
        match self.records.get_mut(id) {
            Some(record) if record.state == SubscriptionState::Subscribing => {
                info!(channel = %id, handle = %record.handle, "Subscribed");
                record.state = SubscriptionState::Subscribed;
                record.deadline = None;
                Some(record.handle)
            }
            Some(record) => {
                debug!(channel = %id, state = ?record.state, "Ignoring subscribed confirmation");
                None
            }
            None => {
                warn!(channel = %id, "Subscribed confirmation for unknown subscription");
                None
            }
        }
    }

    /// Exchange confirmed an unsubscribe
    pub fn on_unsubscribed(&mut self, id: &ChannelId, now: Instant) -> UnsubscribeOutcome {
        let Some(record) = self.records.get_mut(id) else {
            debug!(channel = %id, "Unsubscribed confirmation for unknown subscription");
            return UnsubscribeOutcome::Ignored;
        };

        if record.state != SubscriptionState::Unsubscribing {
            debug!(channel = %id, state = ?record.state, "Ignoring unsubscribed confirmation");
            return UnsubscribeOutcome::Ignored;
        }

        if record.resubscribe {
            info!(channel = %id, handle = %record.handle, "Resubscribing");
            record.state = SubscriptionState::Subscribing;
            record.resubscribe = false;
            record.deadline = Some(now + self.timeout);
            self.outbox.push(OutboundRequest::subscribe(id, &record.params));
            return UnsubscribeOutcome::Resubscribing(record.handle);
        }

        let handle = record.handle;
        self.records.remove(id);
        info!(channel = %id, handle = %handle, "Unsubscribed");
        UnsubscribeOutcome::Idle(handle)
    }

    /// Exchange refused a request; the identity returns to Idle
    pub fn on_rejected(&mut self, id: &ChannelId) -> Option<SubscriptionHandle> {
        match self.records.get(id).map(|record| record.state) {
            Some(SubscriptionState::Subscribing) | Some(SubscriptionState::Unsubscribing) => {
                let record = self.records.remove(id)?;
                warn!(channel = %id, handle = %record.handle, "Subscription rejected");
                Some(record.handle)
            }
            _ => {
                warn!(channel = %id, "Rejection for identity with no pending request");
                None
            }
        }
    }

    /// Start an unsubscribe+subscribe cycle for a subscribed identity
    ///
    /// Returns false when the identity is not subscribed or a resync is
    /// already in flight.
    pub fn resync(&mut self, id: &ChannelId, now: Instant) -> bool {
        let timeout = self.timeout;
        match self.records.get_mut(id) {
            Some(record) if record.state == SubscriptionState::Subscribed => {
                info!(channel = %id, handle = %record.handle, "Resyncing subscription");
                record.state = SubscriptionState::Unsubscribing;
                record.resubscribe = true;
                record.deadline = Some(now + timeout);
                self.outbox
                    .push(OutboundRequest::unsubscribe(id, &record.params));
                true
            }
            _ => false,
        }
    }

    /// Revert requests past their deadline to Idle
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let expired: Vec<Expired> = self
            .records
            .values()
            .filter(|record| record.deadline.is_some_and(|deadline| now >= deadline))
            .map(|record| Expired {
                id: record.id.clone(),
                handle: record.handle,
                state: record.state,
            })
            .collect();

        for entry in &expired {
            warn!(channel = %entry.id, handle = %entry.handle, state = ?entry.state, "Subscription request timed out");
            self.records.remove(&entry.id);
        }
        expired
    }

    /// Transport went away: every identity returns to Idle
    pub fn reset(&mut self) -> Vec<ChannelId> {
        self.outbox.clear();
        self.records.drain().map(|(id, _)| id).collect()
    }

    pub fn state(&self, id: &ChannelId) -> SubscriptionState {
        self.records
            .get(id)
            .map(|record| record.state)
            .unwrap_or(SubscriptionState::Idle)
    }

    /// Whether data for this identity should be accepted
    pub fn is_active(&self, id: &ChannelId) -> bool {
        self.state(id) == SubscriptionState::Subscribed
    }

    pub fn record(&self, id: &ChannelId) -> Option<&SubscriptionRecord> {
        self.records.get(id)
    }

    pub fn handle_of(&self, id: &ChannelId) -> Option<SubscriptionHandle> {
        self.records.get(id).map(|record| record.handle)
    }

    pub fn id_of(&self, handle: SubscriptionHandle) -> Option<ChannelId> {
        self.records
            .values()
            .find(|record| record.handle == handle)
            .map(|record| record.id.clone())
    }

    /// Identities currently in Subscribed
    pub fn active(&self) -> Vec<ChannelId> {
        self.records
            .values()
            .filter(|record| record.state == SubscriptionState::Subscribed)
            .map(|record| record.id.clone())
            .collect()
    }

    /// Every identity with a record, whatever its state
    pub fn identities(&self) -> Vec<ChannelId> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take the requests produced since the last drain
    pub fn drain_outbound(&mut self) -> Vec<OutboundRequest> {
        std::mem::take(&mut self.outbox)
    }

    fn validate(id: &ChannelId, params: &SubscribeParams) -> Result<()> {
        match (id.channel.requires_symbol(), &id.symbol) {
            (true, None) => {
                return Err(FeedError::InvalidSubscription(format!(
                    "{} requires a symbol",
                    id.channel
                )))
            }
            (false, Some(symbol)) => {
                return Err(FeedError::InvalidSubscription(format!(
                    "{} does not take a symbol (got {symbol})",
                    id.channel
                )))
            }
            _ => {}
        }
        if id.channel == Channel::Prices && params.granularity.is_none() {
            return Err(FeedError::InvalidSubscription(
                "prices requires a granularity".to_string(),
            ));
        }
        if id.channel.requires_token() && params.token.is_none() {
            return Err(FeedError::InvalidSubscription(format!(
                "{} requires a token",
                id.channel
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Granularity;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn btc_l2() -> ChannelId {
        ChannelId::symbol_scoped(Channel::L2, "BTC-USD")
    }

    fn subscribed(manager: &mut SubscriptionManager, id: &ChannelId, now: Instant) -> SubscriptionHandle {
        let handle = manager.subscribe(id, SubscribeParams::default(), now).unwrap();
        manager.on_subscribed(id);
        manager.drain_outbound();
        handle
    }

    #[test]
    fn test_subscribe_lifecycle() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();

        let handle = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();
        assert_eq!(manager.state(&id), SubscriptionState::Subscribing);
        assert!(!manager.is_active(&id));
        assert!(matches!(
            manager.drain_outbound().as_slice(),
            [OutboundRequest::Subscribe(_)]
        ));

        assert_eq!(manager.on_subscribed(&id), Some(handle));
        assert!(manager.is_active(&id));

        manager.unsubscribe(handle, now).unwrap();
        assert_eq!(manager.state(&id), SubscriptionState::Unsubscribing);
        assert!(matches!(
            manager.drain_outbound().as_slice(),
            [OutboundRequest::Unsubscribe(_)]
        ));

        assert_eq!(manager.on_unsubscribed(&id, now), UnsubscribeOutcome::Idle(handle));
        assert_eq!(manager.state(&id), SubscriptionState::Idle);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();

        let first = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();
        let second = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.drain_outbound().len(), 1);

        assert_eq!(manager.on_subscribed(&id), Some(first));
        assert_eq!(manager.on_subscribed(&id), None);

        let third = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();
        assert_eq!(first, third);
        assert!(manager.drain_outbound().is_empty());
    }

    #[test]
    fn test_rejection_returns_to_idle() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = ChannelId::symbol_scoped(Channel::L2, "NOPE-USD");
        let handle = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();

        assert_eq!(manager.on_rejected(&id), Some(handle));
        assert_eq!(manager.state(&id), SubscriptionState::Idle);
        assert_eq!(manager.on_rejected(&id), None);
    }

    #[test]
    fn test_resync_cycle_runs_once() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();
        let handle = subscribed(&mut manager, &id, now);

        assert!(manager.resync(&id, now));
        assert!(!manager.resync(&id, now));
        assert!(manager.record(&id).unwrap().is_resyncing());
        let sent = manager.drain_outbound();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], OutboundRequest::Unsubscribe(_)));

        assert_eq!(
            manager.on_unsubscribed(&id, now),
            UnsubscribeOutcome::Resubscribing(handle)
        );
        assert_eq!(manager.state(&id), SubscriptionState::Subscribing);
        let sent = manager.drain_outbound();
        assert!(matches!(sent.as_slice(), [OutboundRequest::Subscribe(_)]));

        assert_eq!(manager.on_subscribed(&id), Some(handle));
        assert!(manager.is_active(&id));
    }

    #[test]
    fn test_unsubscribe_cancels_pending_subscribe() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();
        let handle = manager.subscribe(&id, SubscribeParams::default(), now).unwrap();
        manager.unsubscribe(handle, now).unwrap();
        assert_eq!(manager.drain_outbound().len(), 2);

        // late confirmation of the original subscribe is ignored
        assert_eq!(manager.on_subscribed(&id), None);
        assert_eq!(manager.state(&id), SubscriptionState::Unsubscribing);
        assert_eq!(manager.on_unsubscribed(&id, now), UnsubscribeOutcome::Idle(handle));
    }

    #[test]
    fn test_subscribe_during_unsubscribe_resubscribes() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();
        let handle = subscribed(&mut manager, &id, now);
        manager.unsubscribe(handle, now).unwrap();

        assert_eq!(manager.subscribe(&id, SubscribeParams::default(), now).unwrap(), handle);
        assert_eq!(
            manager.on_unsubscribed(&id, now),
            UnsubscribeOutcome::Resubscribing(handle)
        );
    }

    #[test]
    fn test_caller_unsubscribe_overrides_resync() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let id = btc_l2();
        let handle = subscribed(&mut manager, &id, now);

        manager.resync(&id, now);
        manager.unsubscribe(handle, now).unwrap();
        assert_eq!(manager.drain_outbound().len(), 1);
        assert_eq!(manager.on_unsubscribed(&id, now), UnsubscribeOutcome::Idle(handle));
    }

    #[test]
    fn test_timeouts() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let pending = btc_l2();
        let confirmed = ChannelId::global(Channel::Heartbeat);
        let handle = manager.subscribe(&pending, SubscribeParams::default(), now).unwrap();
        subscribed(&mut manager, &confirmed, now);

        assert!(manager.expire(now + Duration::from_secs(5)).is_empty());

        let expired = manager.expire(now + TIMEOUT);
        assert_eq!(
            expired,
            vec![Expired {
                id: pending.clone(),
                handle,
                state: SubscriptionState::Subscribing,
            }]
        );
        assert_eq!(manager.state(&pending), SubscriptionState::Idle);
        assert!(manager.is_active(&confirmed));
    }

    #[test]
    fn test_reset_drops_everything() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);
        subscribed(&mut manager, &btc_l2(), now);
        manager
            .subscribe(&ChannelId::global(Channel::Symbols), SubscribeParams::default(), now)
            .unwrap();

        let dropped = manager.reset();
        assert_eq!(dropped.len(), 2);
        assert!(manager.is_empty());
        assert!(manager.drain_outbound().is_empty());
        assert!(manager.active().is_empty());
    }

    #[test]
    fn test_validation() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(TIMEOUT);

        let no_symbol = ChannelId::global(Channel::L2);
        assert!(manager.subscribe(&no_symbol, SubscribeParams::default(), now).is_err());

        let symbol_on_global = ChannelId::symbol_scoped(Channel::Balances, "BTC-USD");
        assert!(manager
            .subscribe(&symbol_on_global, SubscribeParams::default(), now)
            .is_err());

        let prices = ChannelId::symbol_scoped(Channel::Prices, "BTC-USD");
        assert!(manager.subscribe(&prices, SubscribeParams::default(), now).is_err());
        assert!(manager
            .subscribe(
                &prices,
                SubscribeParams::with_granularity(Granularity::OneMinute),
                now
            )
            .is_ok());

        let auth = ChannelId::global(Channel::Auth);
        assert!(manager.subscribe(&auth, SubscribeParams::default(), now).is_err());
        assert!(manager
            .subscribe(&auth, SubscribeParams::with_token("token"), now)
            .is_ok());
    }

    #[test]
    fn test_unknown_handle() {
        let mut manager = SubscriptionManager::new(TIMEOUT);
        let handle = SubscriptionHandle(99);
        assert!(matches!(
            manager.unsubscribe(handle, Instant::now()),
            Err(FeedError::NotSubscribed(_))
        ));
    }
}
