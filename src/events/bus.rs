//! Synchronous, failure-isolating event bus.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::ProfileSet;

/// Receiver of published events.
pub trait Subscriber<E>: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Handle one event. An error is logged by the bus and does not stop
    /// delivery to the remaining subscribers.
    fn on_event(&self, event: &E) -> Result<()>;
}

/// Handle returned by [`EventBus::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscriber that returned an error or panicked during a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscriber: String,
    pub reason: String,
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that handled the event
    pub delivered: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl PublishReport {
    /// True when every subscriber handled the event.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered list of subscribers receiving events of type `E`.
pub struct EventBus<E> {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn Subscriber<E>>)>>,
}

/// The bus carrying profile update batches.
pub type ConfigEventBus = EventBus<ProfileSet>;

impl<E> EventBus<E> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Append a subscriber; it receives events after all earlier registrations.
    pub fn register(&self, subscriber: Arc<dyn Subscriber<E>>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        info!(subscriber = subscriber.name(), id = %id, "Registered subscriber");
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|(sid, _)| *sid == id) {
            Some(index) => {
                let (_, subscriber) = subscribers.remove(index);
                info!(subscriber = subscriber.name(), id = %id, "Unregistered subscriber");
                true
            }
            None => false,
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `event` to every subscriber in registration order.
    ///
    /// Returns once all subscribers have been called. The subscriber list is
    /// snapshotted first, so subscribers may register or unregister from
    /// inside `on_event` without deadlocking.
    pub fn publish(&self, event: &E) -> PublishReport {
        let snapshot: Vec<Arc<dyn Subscriber<E>>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let mut report = PublishReport::default();
        for subscriber in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event)));
            let reason = match outcome {
                Ok(Ok(())) => {
                    debug!(subscriber = subscriber.name(), "Notified subscriber");
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };

            error!(
                subscriber = subscriber.name(),
                error = %reason,
                "Error notifying subscriber"
            );
            report.failures.push(SubscriberFailure {
                subscriber: subscriber.name().to_string(),
                reason,
            });
        }
        report
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| s.name().to_string())
            .collect();
        f.debug_struct("EventBus").field("subscribers", &names).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Subscriber<u32> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_event(&self, event: &u32) -> Result<()> {
            self.seen.lock().push(format!("{}:{}", self.name, event));
            Ok(())
        }
    }

    struct Failing;

    impl Subscriber<u32> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_event(&self, _event: &u32) -> Result<()> {
            Err(QuotaError::Config("boom".to_string()))
        }
    }

    struct Panicking;

    impl Subscriber<u32> for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_event(&self, _event: &u32) -> Result<()> {
            panic!("subscriber bug");
        }
    }

    fn recorder(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Subscriber<u32>> {
        Arc::new(Recorder {
            name: name.to_string(),
            seen: Arc::clone(seen),
        })
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(recorder("a", &seen));
        bus.register(recorder("b", &seen));

        let report = bus.publish(&7);

        assert_eq!(report.delivered, 2);
        assert!(report.is_complete());
        assert_eq!(*seen.lock(), vec!["a:7".to_string(), "b:7".to_string()]);
    }

    #[test]
    fn test_failures_do_not_stop_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(Arc::new(Failing));
        bus.register(Arc::new(Panicking));
        bus.register(recorder("last", &seen));

        let report = bus.publish(&1);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].subscriber, "failing");
        assert!(report.failures[1].reason.contains("subscriber bug"));
        assert_eq!(*seen.lock(), vec!["last:1".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = bus.register(recorder("a", &seen));
        bus.register(recorder("b", &seen));

        assert!(bus.unregister(a));
        assert!(!bus.unregister(a));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&2);
        assert_eq!(*seen.lock(), vec!["b:2".to_string()]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::default();
        let report = bus.publish(&0);
        assert_eq!(report, PublishReport::default());
    }
}
