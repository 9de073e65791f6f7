//! Events published by the facade after successful operations.
//!
//! Every event travels on a topic `"/" + container + "/" + key` and carries
//! an [`EventKind`] tag plus a type-erased payload:
//!
//! | Kind     | Payload type        |
//! |----------|---------------------|
//! | `Store`  | `T` (stored value)  |
//! | `Fetch`  | `Option<T>`         |
//! | `Delete` | [`Deleted`]         |
//! | `Merge`  | [`Merge<T>`]        |
//!
//! Subscribers downcast with [`Event::payload`]:
//!
//! ```ignore
//! bus.subscribe("/{container}/{key}", |event, bindings| {
//!     if let Some(merge) = event.payload::<Merge<String>>() {
//!         tracing::info!(key = bindings.get("key"), siblings = merge.siblings.len(), "resolved conflict");
//!     }
//! });
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Which operation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Store,
    Fetch,
    Delete,
    /// Siblings were resolved into one value during a store or fetch.
    Merge,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Store => "store",
            EventKind::Fetch => "fetch",
            EventKind::Delete => "delete",
            EventKind::Merge => "merge",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the topic for a container/key pair.
pub fn topic(container: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("/{}/{}", container, key),
        None => format!("/{}", container),
    }
}

/// Payload of a [`EventKind::Delete`] event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deleted {
    pub container: String,
    pub key: String,
}

/// Payload of a [`EventKind::Merge`] event: the conflicting siblings and
/// the value the resolver chose.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge<T> {
    pub siblings: Vec<T>,
    pub resolved: T,
}

/// A published notification.
#[derive(Clone)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub topic: String,
    pub container: String,
    pub key: Option<String>,
    pub at: DateTime<Utc>,
    payload_type: TypeId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new<P: Any + Send + Sync>(
        kind: EventKind,
        container: impl Into<String>,
        key: Option<String>,
        payload: P,
    ) -> Self {
        let container = container.into();
        Self {
            id: Uuid::new_v4(),
            kind,
            topic: topic(&container, key.as_deref()),
            container,
            key,
            at: Utc::now(),
            payload_type: TypeId::of::<P>(),
            payload: Arc::new(payload),
        }
    }

    /// Downcast the payload to a concrete type.
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.downcast_ref()
    }

    /// Returns true if the payload is a `P`.
    pub fn carries<P: Any>(&self) -> bool {
        self.payload_type == TypeId::of::<P>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
