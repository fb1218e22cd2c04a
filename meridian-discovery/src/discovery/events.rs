//! Event fan-out from the registry to watchers
//!
//! Every subscriber owns a bounded queue. Publishing never blocks the
//! mutation path: when a queue is full the new event is dropped for that
//! subscriber and counted.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::instance::ServiceEvent;

struct Subscription {
    id: u64,
    service: Option<String>,
    sender: mpsc::Sender<ServiceEvent>,
}

impl Subscription {
    fn wants(&self, event: &ServiceEvent) -> bool {
        self.service
            .as_deref()
            .is_none_or(|service| service == event.service())
    }
}

/// Receiving end of a registry subscription
///
/// Dropping the watcher unsubscribes it on the next publish.
pub struct Watcher {
    id: u64,
    service: Option<String>,
    receiver: mpsc::Receiver<ServiceEvent>,
}

impl Watcher {
    /// Wait for the next event. Returns `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        self.receiver.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Service this watcher is scoped to, `None` for all services
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }
}

/// Bounded, non-blocking publisher
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to events, optionally only those of one service
    pub fn subscribe(&self, service: Option<String>) -> Watcher {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.write().push(Subscription {
            id,
            service: service.clone(),
            sender,
        });
        debug!(watcher_id = id, service = ?service, "Watcher subscribed");

        Watcher {
            id,
            service,
            receiver,
        }
    }

    /// Deliver an event to every interested subscriber. Returns how many
    /// queues accepted it.
    pub fn publish(&self, event: &ServiceEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter().filter(|s| s.wants(event)) {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            watcher_id = subscriber.id,
                            kind = %event.kind,
                            instance_id = %event.instance.id,
                            capacity = self.capacity,
                            dropped_total = total,
                            "Watcher queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers.write().retain(|s| !closed.contains(&s.id));
            debug!(watchers = ?closed, "Removed closed watchers");
        }

        delivered
    }

    /// Events dropped because a subscriber queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::instance::{EventKind, ServiceInstance};

    fn event(kind: EventKind, id: &str, service: &str) -> ServiceEvent {
        ServiceEvent::new(kind, ServiceInstance::new(id, service, "10.0.0.1:80"))
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe(None);
        let mut b = bus.subscribe(None);

        assert_eq!(bus.publish(&event(EventKind::Registered, "api-1", "api")), 2);

        assert_eq!(a.recv().await.unwrap().instance.id, "api-1");
        assert_eq!(b.recv().await.unwrap().kind, EventKind::Registered);
    }

    #[tokio::test]
    async fn test_service_scoped_watcher() {
        let bus = EventBus::new(8);
        let mut api = bus.subscribe(Some("api".to_string()));

        bus.publish(&event(EventKind::Registered, "db-1", "db"));
        bus.publish(&event(EventKind::Registered, "api-1", "api"));

        let received = api.recv().await.unwrap();
        assert_eq!(received.instance.id, "api-1");
        assert!(api.try_recv().is_none());
        assert_eq!(api.service(), Some("api"));
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let bus = EventBus::new(2);
        let mut watcher = bus.subscribe(None);

        for i in 0..5 {
            bus.publish(&event(EventKind::Registered, &format!("api-{i}"), "api"));
        }

        assert_eq!(bus.dropped(), 3);
        // the oldest events were kept
        assert_eq!(watcher.try_recv().unwrap().instance.id, "api-0");
        assert_eq!(watcher.try_recv().unwrap().instance.id, "api-1");
        assert!(watcher.try_recv().is_none());
    }

    #[test]
    fn test_closed_watchers_are_pruned() {
        let bus = EventBus::new(4);
        let watcher = bus.subscribe(None);
        let _kept = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 2);

        drop(watcher);
        assert_eq!(bus.publish(&event(EventKind::Expired, "api-1", "api")), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
