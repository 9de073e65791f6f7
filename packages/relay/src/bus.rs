//! Topic-routed event bus.
//!
//! # Guarantees
//!
//! - **Synchronous delivery**: `publish` runs every matching handler on the
//!   publishing thread before it returns
//! - **Registration order**: handlers matching a topic run in the order they
//!   subscribed
//! - **In-memory only**: events are not persisted or replayed; a subscriber
//!   sees only events published after it subscribed
//!
//! A panicking handler is contained: the remaining handlers still run and the
//! panic is reported as a fault on the bus's dispatcher.
//!
//! The facade publishes on the dispatcher lane that executed the operation,
//! so handlers for one key never run concurrently with the next operation
//! on that key when the lane is sequential.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::dispatch::Dispatcher;
use crate::error::panic_message;
use crate::event::Event;
use crate::selector::{Bindings, RegistrationId, Selector, SelectorRegistry};

type Handler = Arc<dyn Fn(&Event, &Bindings) + Send + Sync>;

/// Handle returned by [`TopicBus::subscribe`]; pass it to
/// [`TopicBus::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: RegistrationId,
    selector: Selector,
}

impl Subscription {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}

/// Subscriber table keyed by topic selectors.
///
/// Cloning a `TopicBus` yields another handle to the same table.
#[derive(Clone)]
pub struct TopicBus {
    subscribers: Arc<SelectorRegistry<Handler>>,
    faults: Option<Dispatcher>,
}

impl TopicBus {
    /// Create a bus that logs handler panics.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(SelectorRegistry::new()),
            faults: None,
        }
    }

    /// Create a bus that reports handler panics to `dispatcher`'s fault
    /// channel.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            subscribers: Arc::new(SelectorRegistry::new()),
            faults: Some(dispatcher),
        }
    }

    /// Subscribe to every topic matching `template`, e.g. `/{container}/{key}`.
    pub fn subscribe<F>(&self, template: &str, handler: F) -> Subscription
    where
        F: Fn(&Event, &Bindings) + Send + Sync + 'static,
    {
        self.subscribe_with(Selector::template(template), handler)
    }

    /// Subscribe with an arbitrary selector.
    pub fn subscribe_with<F>(&self, selector: Selector, handler: F) -> Subscription
    where
        F: Fn(&Event, &Bindings) + Send + Sync + 'static,
    {
        let registration = self.subscribers.register(selector.clone(), Arc::new(handler));
        Subscription {
            id: registration.id(),
            selector,
        }
    }

    /// Stop delivering to `subscription`. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.subscribers.deregister(subscription.id)
    }

    /// Deliver `event` to every handler whose selector matches its topic.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        for matched in self.subscribers.select(&event.topic) {
            delivered += 1;
            let handler = matched.payload();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event, matched.bindings())));
            if let Err(payload) = outcome {
                let message = panic_message(&payload);
                match &self.faults {
                    Some(dispatcher) => dispatcher.report_fault("subscriber", message),
                    None => error!(topic = %event.topic, panic = %message, "subscriber panicked"),
                }
            }
        }
        trace!(topic = %event.topic, kind = %event.kind, delivered, "event published");
        delivered
    }

    /// Returns the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TopicBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
