//! Live subscription registry and fan-out.
//!
//! Every connection registers a bounded outbound queue. Publishing never
//! awaits: a connection whose queue is full is cancelled instead of slowing
//! down ingestion for everyone else. A fresh subscription buffers live
//! matches while its stored events are being sent and flushes them once the
//! end-of-stored-events marker is out.
//!
//! Each subscription gets a fresh generation number. Deliveries carry it, so
//! events queued for a closed subscription are dropped even when the client
//! reuses the id right away.

use crate::codec::RelayMessage;
use crate::error::Error;
use crate::filter;
use crate::metrics;
use dashmap::DashMap;
use nostr::{Event, EventId, Filter};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ConnectionId = u64;

#[derive(Debug)]
enum Phase {
    Backfilling(Vec<Event>),
    Live,
}

/// A message waiting in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub message: RelayMessage,
    /// Set for deliveries, naming the subscription generation they matched.
    pub generation: Option<u64>,
}

impl Outbound {
    pub fn reply(message: RelayMessage) -> Self {
        Self {
            message,
            generation: None,
        }
    }

    pub fn delivery(subscription_id: &str, generation: u64, event: Event) -> Self {
        Self {
            message: RelayMessage::event(subscription_id, event),
            generation: Some(generation),
        }
    }

    fn subscription_id(&self) -> Option<&str> {
        match &self.message {
            RelayMessage::Event {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Subscription {
    generation: u64,
    filters: Vec<Filter>,
    phase: Mutex<Phase>,
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    subscriptions: HashMap<String, Arc<Subscription>>,
}

enum Delivery {
    Sent,
    Buffered,
    Overflow,
    Closed,
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    max_subscriptions: usize,
    max_pending: usize,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(max_subscriptions: usize, max_pending: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_subscriptions,
            max_pending,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) {
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                cancel,
                subscriptions: HashMap::new(),
            },
        );
    }

    /// Drops the connection and every subscription it owns.
    pub fn unregister(&self, connection_id: ConnectionId) -> usize {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return 0;
        };
        let count = entry.subscriptions.len();
        metrics::active_subscriptions().decrement(count as f64);
        debug!(
            target: "subscriptions",
            "Connection {} removed with {} subscription(s)", connection_id, count
        );
        count
    }

    /// Registers `subscription_id` in the backfilling phase, replacing any
    /// subscription with the same id on this connection. Returns the new
    /// subscription's generation.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<u64, Error> {
        let mut entry = self
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| Error::internal(format!("Unknown connection {connection_id}")))?;

        let replacing = entry.subscriptions.contains_key(subscription_id);
        if !replacing && entry.subscriptions.len() >= self.max_subscriptions {
            return Err(Error::blocked(format!(
                "too many subscriptions (max {})",
                self.max_subscriptions
            )));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entry.subscriptions.insert(
            subscription_id.to_string(),
            Arc::new(Subscription {
                generation,
                filters,
                phase: Mutex::new(Phase::Backfilling(Vec::new())),
            }),
        );
        if !replacing {
            metrics::active_subscriptions().increment(1.0);
        }
        debug!(
            target: "subscriptions",
            "Connection {} subscribed {}", connection_id, subscription_id
        );
        Ok(generation)
    }

    /// Switches a subscription to live delivery, first flushing whatever
    /// matched while stored events were being sent. Events in `sent` were
    /// already delivered from storage and are skipped.
    pub fn activate(
        &self,
        connection_id: ConnectionId,
        subscription_id: &str,
        sent: &HashSet<EventId>,
    ) {
        let overflow = {
            let Some(entry) = self.connections.get(&connection_id) else {
                return;
            };
            let Some(subscription) = entry.subscriptions.get(subscription_id) else {
                return;
            };

            let mut phase = subscription.phase.lock();
            let pending = match std::mem::replace(&mut *phase, Phase::Live) {
                Phase::Backfilling(pending) => pending,
                Phase::Live => Vec::new(),
            };

            let mut overflow = false;
            for event in pending.into_iter().filter(|event| !sent.contains(&event.id)) {
                match entry.sender.try_send(Outbound::delivery(
                    subscription_id,
                    subscription.generation,
                    event,
                )) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflow = true;
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            overflow
        };

        if overflow {
            self.disconnect_slow(connection_id);
        }
    }

    /// Returns whether a subscription was removed. Once this returns no
    /// further events are matched for it.
    pub fn unsubscribe(&self, connection_id: ConnectionId, subscription_id: &str) -> bool {
        let removed = self
            .connections
            .get_mut(&connection_id)
            .and_then(|mut entry| entry.subscriptions.remove(subscription_id))
            .is_some();
        if removed {
            metrics::active_subscriptions().decrement(1.0);
            debug!(
                target: "subscriptions",
                "Connection {} closed {}", connection_id, subscription_id
            );
        }
        removed
    }

    pub fn generation(&self, connection_id: ConnectionId, subscription_id: &str) -> Option<u64> {
        self.connections
            .get(&connection_id)
            .and_then(|entry| entry.subscriptions.get(subscription_id).map(|s| s.generation))
    }

    /// Whether a queued message should still reach the client. Replies always
    /// do; deliveries only while their subscription generation is open.
    pub fn is_current(&self, connection_id: ConnectionId, outbound: &Outbound) -> bool {
        match (outbound.subscription_id(), outbound.generation) {
            (Some(subscription_id), Some(generation)) => {
                self.generation(connection_id, subscription_id) == Some(generation)
            }
            _ => true,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fans `event` out to every matching subscription. Returns the number of
    /// deliveries queued or buffered.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for entry in self.connections.iter() {
            for (subscription_id, subscription) in entry.subscriptions.iter() {
                if !filter::matches_any(&subscription.filters, event) {
                    continue;
                }
                match self.deliver(&entry, subscription_id, subscription, event) {
                    Delivery::Sent | Delivery::Buffered => delivered += 1,
                    Delivery::Overflow => {
                        overflowed.push(*entry.key());
                        break;
                    }
                    Delivery::Closed => break,
                }
            }
        }

        for connection_id in overflowed {
            self.disconnect_slow(connection_id);
        }
        delivered
    }

    fn deliver(
        &self,
        entry: &ConnectionEntry,
        subscription_id: &str,
        subscription: &Subscription,
        event: &Event,
    ) -> Delivery {
        let mut phase = subscription.phase.lock();
        match &mut *phase {
            Phase::Backfilling(pending) => {
                if pending.len() >= self.max_pending {
                    return Delivery::Overflow;
                }
                pending.push(event.clone());
                Delivery::Buffered
            }
            Phase::Live => match entry.sender.try_send(Outbound::delivery(
                subscription_id,
                subscription.generation,
                event.clone(),
            )) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => Delivery::Overflow,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }

    fn disconnect_slow(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.get(&connection_id) {
            warn!(
                target: "subscriptions",
                "Connection {} outbound queue is full, disconnecting", connection_id
            );
            metrics::broadcast_overflows().increment(1);
            entry.cancel.cancel();
        }
        self.unregister(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::signed_event;
    use nostr::{Keys, Kind};
    use pretty_assertions::assert_eq;

    fn connect(
        registry: &SubscriptionRegistry,
        id: ConnectionId,
        capacity: usize,
    ) -> (mpsc::Receiver<Outbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        registry.register(id, tx, token.clone());
        (rx, token)
    }

    #[tokio::test]
    async fn test_live_delivery_after_activation() {
        let registry = SubscriptionRegistry::new(20, 100);
        let (mut rx, _) = connect(&registry, 1, 10);
        let keys = Keys::generate();

        registry
            .subscribe(1, "notes", vec![Filter::new().kind(Kind::TextNote)])
            .unwrap();
        let buffered = signed_event(&keys, Kind::TextNote, "during backfill", vec![]);
        assert_eq!(registry.publish(&buffered), 1);
        assert!(rx.try_recv().is_err());

        registry.activate(1, "notes", &HashSet::new());
        assert_eq!(
            rx.try_recv().unwrap().message,
            RelayMessage::event("notes", buffered.clone())
        );

        let live = signed_event(&keys, Kind::TextNote, "live", vec![]);
        let reaction = signed_event(&keys, Kind::Reaction, "+", vec![]);
        registry.publish(&live);
        registry.publish(&reaction);
        assert_eq!(
            rx.try_recv().unwrap().message,
            RelayMessage::event("notes", live)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_activation_skips_events_already_sent() {
        let registry = SubscriptionRegistry::new(20, 100);
        let (mut rx, _) = connect(&registry, 1, 10);
        let keys = Keys::generate();

        registry.subscribe(1, "s", vec![Filter::new()]).unwrap();
        let event = signed_event(&keys, Kind::TextNote, "both", vec![]);
        registry.publish(&event);
        registry.activate(1, "s", &HashSet::from([event.id]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new(20, 100);
        let (mut rx, _) = connect(&registry, 1, 10);
        let keys = Keys::generate();

        registry.subscribe(1, "s", vec![Filter::new()]).unwrap();
        registry.activate(1, "s", &HashSet::new());
        assert!(registry.unsubscribe(1, "s"));
        assert_eq!(registry.generation(1, "s"), None);

        registry.publish(&signed_event(&keys, Kind::TextNote, "x", vec![]));
        assert!(rx.try_recv().is_err());
        assert!(!registry.unsubscribe(1, "s"));
    }

    #[tokio::test]
    async fn test_resubscribe_drops_queued_deliveries() {
        let registry = SubscriptionRegistry::new(20, 100);
        let (mut rx, _) = connect(&registry, 1, 10);
        let keys = Keys::generate();

        let first = registry.subscribe(1, "s", vec![Filter::new()]).unwrap();
        registry.activate(1, "s", &HashSet::new());
        let stale = signed_event(&keys, Kind::TextNote, "old", vec![]);
        registry.publish(&stale);

        assert!(registry.unsubscribe(1, "s"));
        let second = registry
            .subscribe(1, "s", vec![Filter::new().kind(Kind::Reaction)])
            .unwrap();
        assert_ne!(first, second);
        registry.activate(1, "s", &HashSet::new());
        let fresh = signed_event(&keys, Kind::Reaction, "+", vec![]);
        registry.publish(&fresh);

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.generation, Some(first));
        assert!(!registry.is_current(1, &queued));

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.message, RelayMessage::event("s", fresh));
        assert!(registry.is_current(1, &queued));

        assert!(registry.is_current(1, &Outbound::reply(RelayMessage::eose("s"))));
    }

    #[tokio::test]
    async fn test_subscription_ceiling() {
        let registry = SubscriptionRegistry::new(2, 100);
        let (_rx, _) = connect(&registry, 1, 10);
        registry.subscribe(1, "a", vec![Filter::new()]).unwrap();
        registry.subscribe(1, "b", vec![Filter::new()]).unwrap();
        registry.subscribe(1, "a", vec![Filter::new()]).unwrap();

        let error = registry.subscribe(1, "c", vec![Filter::new()]).unwrap_err();
        assert!(error.to_string().starts_with("blocked:"));
        assert_eq!(registry.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_disconnected() {
        let registry = SubscriptionRegistry::new(20, 100);
        let (_slow_rx, slow_token) = connect(&registry, 1, 1);
        let (mut fast_rx, fast_token) = connect(&registry, 2, 10);
        let keys = Keys::generate();

        for id in [1, 2] {
            registry.subscribe(id, "s", vec![Filter::new()]).unwrap();
            registry.activate(id, "s", &HashSet::new());
        }

        registry.publish(&signed_event(&keys, Kind::TextNote, "1", vec![]));
        registry.publish(&signed_event(&keys, Kind::TextNote, "2", vec![]));

        assert!(slow_token.is_cancelled());
        assert!(!fast_token.is_cancelled());
        assert_eq!(registry.connection_count(), 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }
}
