//! Structured error types and dispatch faults for relay.
//!
//! `RelayError` is the only error that crosses a [`Promise`](crate::Promise)
//! or [`Composable`](crate::Composable) boundary. Collaborators (store
//! clients, repositories, user closures) report failures as `anyhow::Error`;
//! relay wraps them into the variant that says *where* the failure happened.
//!
//! # The Error Boundary Rule
//!
//! > **Operation failures are delivered, never thrown.**
//!
//! - `store`/`fetch`/`delete` always return a pending handle immediately
//! - every failure of the scheduled work lands in that handle as a `RelayError`
//! - panics inside callbacks that have no handle to fail become a
//!   [`DispatchFault`] on the owning dispatcher's fault channel
//!
//! # Example
//!
//! ```ignore
//! use relay::RelayError;
//!
//! match facade.fetch::<String>("users", "42").await_timeout(timeout) {
//!     Ok(Some(name)) => println!("found {name}"),
//!     Ok(None) => println!("absent"),
//!     Err(RelayError::Timeout { .. }) => println!("still running"),
//!     Err(RelayError::Operation { container, .. }) => println!("{container} failed"),
//!     Err(e) => println!("other: {e}"),
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Shared handle to a collaborator error.
///
/// One terminal outcome is observed by every waiter and callback, so the
/// underlying `anyhow::Error` is reference counted rather than moved.
#[derive(Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Borrow the wrapped error (for `downcast_ref` and chain inspection).
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{:#}` keeps the context chain on one line
        write!(f, "{:#}", self.0)
    }
}

impl From<anyhow::Error> for Cause {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

// =============================================================================
// Relay Error
// =============================================================================

/// Structured error type for relay operations.
///
/// Every variant is cheap to clone so that a single failure can be handed to
/// all waiters of a [`Promise`](crate::Promise).
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Resource lookup or creation against the store client failed.
    #[error("failed to acquire resource '{name}': {cause}")]
    Acquisition {
        /// The container name that could not be acquired.
        name: String,
        cause: Cause,
    },

    /// A built operation's `execute()` failed.
    #[error("{kind} operation on {topic} failed: {cause}")]
    Operation {
        /// Which operation failed (`store`, `fetch`, `delete`, `send`).
        kind: &'static str,
        /// Container the operation targeted.
        container: String,
        /// Topic the operation would have published on.
        topic: String,
        cause: Cause,
    },

    /// A timed wait elapsed before the outcome was known.
    ///
    /// Local to the waiting call: the underlying work keeps running.
    #[error("await timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// Attempted to settle a promise that already has an outcome.
    #[error("promise already completed")]
    AlreadyCompleted,

    /// A lookup that needs exactly one match found none.
    #[error("no selector matches '{key}'")]
    NoMatchingSelector {
        /// The key that was looked up.
        key: String,
    },

    /// The sequential lane's bounded queue is full.
    #[error("dispatcher '{dispatcher}' queue is full (capacity {capacity})")]
    QueueFull {
        dispatcher: String,
        capacity: usize,
    },

    /// The dispatcher was shut down before the work could be scheduled.
    #[error("dispatcher '{dispatcher}' is shut down")]
    Shutdown { dispatcher: String },

    /// A user closure (map, consume, repository delegate, resolver) failed
    /// or panicked.
    #[error("callback failed: {cause}")]
    Callback { cause: Cause },

    /// A value could not be encoded to or decoded from its stored form.
    #[error("codec '{codec}' failed: {cause}")]
    Codec { codec: &'static str, cause: Cause },

    /// A composable completed without delivering any value.
    #[error("composable completed without a value")]
    Empty,
}

impl RelayError {
    pub(crate) fn callback(err: anyhow::Error) -> Self {
        RelayError::Callback {
            cause: Cause::new(err),
        }
    }

    pub(crate) fn panicked(message: &str) -> Self {
        RelayError::callback(anyhow::anyhow!("panicked: {}", message))
    }

    /// Returns true for failures that came from the store or repository
    /// rather than from relay's own bookkeeping.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Acquisition { .. } | RelayError::Operation { .. }
        )
    }

    /// Returns true if this is a timed-out wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout { .. })
    }
}

// =============================================================================
// Dispatch Fault
// =============================================================================

/// A failure that happened inside scheduled work or a callback and had no
/// promise to land in.
///
/// Published on [`Dispatcher::faults`](crate::Dispatcher::faults).
#[derive(Debug, Clone)]
pub struct DispatchFault {
    /// Name of the dispatcher that observed the fault.
    pub dispatcher: String,
    /// Where the fault happened (`unit`, `promise callback`, `subscriber`...).
    pub origin: &'static str,
    /// Panic payload or error message.
    pub message: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for DispatchFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} fault: {}",
            self.dispatcher, self.origin, self.message
        )
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display_includes_topic_and_cause() {
        let err = RelayError::Operation {
            kind: "store",
            container: "orders".into(),
            topic: "/orders/42".into(),
            cause: Cause::new(anyhow::anyhow!("connection reset")),
        };
        let display = err.to_string();
        assert!(display.contains("store operation on /orders/42"));
        assert!(display.contains("connection reset"));
    }

    #[test]
    fn test_cause_keeps_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("fetching bucket");
        let display = Cause::new(err).to_string();
        assert!(display.contains("fetching bucket"));
        assert!(display.contains("socket closed"));
    }

    #[test]
    fn test_timeout_display() {
        let err = RelayError::Timeout {
            duration: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_timeout());
        assert!(!err.is_collaborator_failure());
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = RelayError::NoMatchingSelector {
            key: "find_by_email".into(),
        };
        match &err {
            RelayError::NoMatchingSelector { key } => assert_eq!(key, "find_by_email"),
            _ => panic!("Expected NoMatchingSelector"),
        }
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = RelayError::Acquisition {
            name: "users".into(),
            cause: Cause::new(anyhow::anyhow!("no route to host")),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(cloned.is_collaborator_failure());
    }

    #[test]
    fn test_cause_downcast() {
        #[derive(Debug, Error)]
        #[error("retries exhausted")]
        struct RetriesExhausted;

        let cause = Cause::new(RetriesExhausted.into());
        assert!(cause.inner().downcast_ref::<RetriesExhausted>().is_some());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(&payload), "owned boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&payload), "unknown panic");
    }

    #[test]
    fn test_fault_display() {
        let fault = DispatchFault {
            dispatcher: "relay-io".into(),
            origin: "subscriber",
            message: "index out of bounds".into(),
            at: Utc::now(),
        };
        assert_eq!(
            fault.to_string(),
            "[relay-io] subscriber fault: index out of bounds"
        );
    }
}
