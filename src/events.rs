use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

/// Events shared between the registry, controller and proxy. Instances are
/// fanned out read-only; payloads are cheap to clone.
#[derive(Debug, Clone)]
pub enum Event {
    ImagePushed {
        name: String,
        reference: String,
        manifest: Bytes,
        annotations: HashMap<String, String>,
    },
    ConfigReload,
    ManualReload,
    RouteAdded { domain: String },
    RouteRemoved { domain: String },
    /// A route exhausted its deploy retries and is no longer retried
    /// automatically.
    RouteDegraded { domain: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ImagePushed,
    ConfigReload,
    ManualReload,
    RouteAdded,
    RouteRemoved,
    RouteDegraded,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ImagePushed { .. } => EventKind::ImagePushed,
            Event::ConfigReload => EventKind::ConfigReload,
            Event::ManualReload => EventKind::ManualReload,
            Event::RouteAdded { .. } => EventKind::RouteAdded,
            Event::RouteRemoved { .. } => EventKind::RouteRemoved,
            Event::RouteDegraded { .. } => EventKind::RouteDegraded,
        }
    }
}

/// A registered event consumer. `handle` runs on the publisher's task and
/// must return quickly; long work is offloaded to spawned tasks.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, kind: EventKind) -> bool;
    fn handle(&self, event: &Event);
}

/// In-process publish/subscribe. Delivery is synchronous, at-least-once, and
/// per subscriber follows publish order (registration order across
/// subscribers for a single publish).
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// Delivers to every matching subscriber. A misbehaving handler is
    /// contained and logged; publishing never fails upstream.
    pub fn publish(&self, event: Event) {
        let subscribers = self
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();
        let kind = event.kind();
        for subscriber in subscribers {
            if !subscriber.can_handle(kind) {
                continue;
            }
            tracing::trace!(subscriber = subscriber.name(), event = ?kind, "dispatching event");
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.handle(&event)
            }));
            if outcome.is_err() {
                tracing::error!(subscriber = subscriber.name(), event = ?kind, "event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        only: Option<EventKind>,
        seen: Mutex<Vec<EventKind>>,
    }

    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, kind: EventKind) -> bool {
            self.only.map_or(true, |k| k == kind)
        }

        fn handle(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.kind());
        }
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let rec = Arc::new(Recorder {
            name: "rec",
            only: None,
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(rec.clone());

        bus.publish(Event::ConfigReload);
        bus.publish(Event::RouteAdded {
            domain: "app.example.com".into(),
        });
        bus.publish(Event::ManualReload);

        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec![EventKind::ConfigReload, EventKind::RouteAdded, EventKind::ManualReload]
        );
    }

    #[test]
    fn panicking_handler_does_not_poison_the_bus() {
        struct Panicker;
        impl Subscriber for Panicker {
            fn name(&self) -> &str {
                "panicker"
            }
            fn can_handle(&self, _kind: EventKind) -> bool {
                true
            }
            fn handle(&self, _event: &Event) {
                panic!("handler bug");
            }
        }

        let bus = EventBus::new();
        bus.subscribe(Arc::new(Panicker));
        let rec = Arc::new(Recorder {
            name: "survivor",
            only: None,
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(rec.clone());

        bus.publish(Event::ConfigReload);
        assert_eq!(*rec.seen.lock().unwrap(), vec![EventKind::ConfigReload]);
    }

    #[test]
    fn respects_can_handle() {
        let bus = EventBus::new();
        let rec = Arc::new(Recorder {
            name: "reloads-only",
            only: Some(EventKind::ConfigReload),
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(rec.clone());

        bus.publish(Event::RouteRemoved {
            domain: "app.example.com".into(),
        });
        bus.publish(Event::ConfigReload);

        assert_eq!(*rec.seen.lock().unwrap(), vec![EventKind::ConfigReload]);
    }
}
