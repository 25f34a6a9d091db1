//! Publish/subscribe propagation of profile updates.
//!
//! Administrative updates are published on a [`ConfigEventBus`]; the
//! [`ProfileRegistry`](crate::ratelimit::ProfileRegistry) is the canonical
//! subscriber. Other components (audit logs, caches) may register too.

mod bus;

pub use bus::{ConfigEventBus, EventBus, PublishReport, SubscriberFailure, Subscriber, SubscriptionId};
