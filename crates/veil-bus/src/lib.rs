//! In-process topic event bus.
//!
//! Components publish typed events to string topics; subscribers attach a
//! handler per topic. Handlers run synchronously on the publisher's task, so
//! they must be cheap and non-blocking — anything heavier hands the event off
//! to its own channel or task (the state keeper and broadcast hub both do).
//!
//! A published event whose concrete type does not match what a handler
//! subscribed for is skipped for that handler with a warning. That keeps a
//! mis-paired topic from panicking the publisher at runtime.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Identifies one subscription on one topic, for later teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no subscription {1:?} on topic {0:?}")]
    UnknownSubscription(String, SubscriptionId),
}

type BoxedHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: BoxedHandler,
}

/// Publish/subscribe hub shared across the node's components.
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach `handler` to `topic` for events of type `E`.
    pub fn subscribe<E, F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        E: Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let topic_name = topic.to_owned();
        let boxed: BoxedHandler = Arc::new(move |event: &(dyn Any + Send + Sync)| {
            match event.downcast_ref::<E>() {
                Some(event) => handler(event),
                None => tracing::warn!(
                    topic = %topic_name,
                    expected = std::any::type_name::<E>(),
                    "event type mismatch, handler skipped"
                ),
            }
        });

        self.topics
            .write()
            .entry(topic.to_owned())
            .or_default()
            .push(Subscription { id, handler: boxed });
        id
    }

    /// Detach a previously registered handler.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError> {
        let mut topics = self.topics.write();
        let subs = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownSubscription(topic.to_owned(), id))?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(BusError::UnknownSubscription(topic.to_owned(), id));
        }
        if subs.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }

    /// Deliver `event` to every handler on `topic`, in subscription order.
    /// Handlers are invoked outside the registry lock, so a handler may
    /// publish further events without deadlocking.
    pub fn publish<E: Send + Sync + 'static>(&self, topic: &str, event: E) {
        tracing::debug!(topic, "publishing event");
        let handlers: Vec<BoxedHandler> = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|s| Arc::clone(&s.handler)).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn delivers_typed_event() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.subscribe::<String, _>("greetings", move |s| {
            seen2.lock().unwrap().push(s.clone());
        });

        bus.publish("greetings", "hello".to_owned());
        bus.publish("greetings", "world".to_owned());

        assert_eq!(*seen.lock().unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn multiple_handlers_all_fire() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.subscribe::<u32, _>("ticks", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish("ticks", 7u32);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn type_mismatch_is_skipped() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe::<u32, _>("ticks", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("ticks", "not a number".to_owned());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish("ticks", 1u32);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let id = bus.subscribe::<u32, _>("ticks", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("ticks", 1u32);
        bus.unsubscribe("ticks", id).unwrap();
        bus.publish("ticks", 2u32);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_unknown_errors() {
        let bus = EventBus::new();
        let id = bus.subscribe::<u32, _>("a", |_| {});
        assert!(bus.unsubscribe("b", id).is_err());
        assert!(bus.unsubscribe("a", SubscriptionId(9999)).is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody-home", 42u64);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let inner_count = Arc::clone(&count);
        bus.subscribe::<u32, _>("second", move |_| {
            inner_count.fetch_add(1, Ordering::SeqCst);
        });

        let bus2 = Arc::clone(&bus);
        bus.subscribe::<u32, _>("first", move |n| {
            bus2.publish("second", *n);
        });

        bus.publish("first", 1u32);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
