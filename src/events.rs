// In-process publish/subscribe fan-out from the engine to its collaborators.
//
// Handlers run synchronously on whatever task publishes, in registration
// order. A handler that panics is caught and logged so the remaining
// handlers still see the event. Events published before a subscriber
// attaches are not replayed.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{error, warn};

use crate::models::Contact;
use crate::signaling::{CallSignal, CallStatus};

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum Event {
    /// The full contact set after any roster or presence mutation. This is a
    /// snapshot: subscribers never observe the store mid-update.
    RosterChanged(Vec<Contact>),
    /// A plain chat message (anything that did not decode as signaling).
    MessageReceived { from: String, body: String },
    /// An inbound call invitation received while no attempt was pending.
    CallInviteReceived { from: String, signal: CallSignal },
    /// The peer accepted our call; `url` is ready to join.
    CallReady { with: String, url: String },
    /// Our outbound attempt ended without being accepted.
    CallEnded { with: String, reason: CallStatus },
    /// An unsolicited meeting invitation carrying a direct join URL.
    MeetingInvite { from: String, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Roster,
    Message,
    CallInvite,
    CallReady,
    CallEnded,
    MeetingInvite,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RosterChanged(_) => EventKind::Roster,
            Event::MessageReceived { .. } => EventKind::Message,
            Event::CallInviteReceived { .. } => EventKind::CallInvite,
            Event::CallReady { .. } => EventKind::CallReady,
            Event::CallEnded { .. } => EventKind::CallEnded,
            Event::MeetingInvite { .. } => EventKind::MeetingInvite,
        }
    }
}

/// Token returned by `subscribe`, used to unsubscribe on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

/// Owned by the engine instance; there is no process-global registry.
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriberId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .entry(kind)
            .or_insert_with(Vec::new)
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handlers) = subscribers.get_mut(&kind) {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            return handlers.len() != before;
        }
        false
    }

    pub fn publish(&self, event: &Event) {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(handlers) = subscribers.get(&event.kind()) else {
            return;
        };
        for (id, handler) in handlers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                error!("Event handler {:?} panicked on {:?}", id, event.kind());
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.get(&kind).map(|h| h.len()).unwrap_or(0),
            Err(_) => {
                warn!("Subscriber registry lock poisoned while counting");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn message(body: &str) -> Event {
        Event::MessageReceived {
            from: "bob@example.com".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(EventKind::Message, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        bus.publish(&message("hi"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::Message, |_| panic!("handler exploded"));
        let delivered_clone = delivered.clone();
        bus.subscribe(EventKind::Message, move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&message("hi"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let delivered_clone = delivered.clone();
        let id = bus.subscribe(EventKind::Message, move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&message("one"));
        assert!(bus.unsubscribe(EventKind::Message, id));
        assert!(!bus.unsubscribe(EventKind::Message, id));
        bus.publish(&message("two"));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_before_subscription_are_lost() {
        let bus = EventBus::new();
        bus.publish(&message("nobody hears this"));

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = delivered.clone();
        bus.subscribe(EventKind::Message, move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        bus.publish(&message("heard"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
