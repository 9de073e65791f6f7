//! # Relay
//!
//! Non-blocking commands over a blocking key-value store client.
//!
//! Callers get a [`Promise`] back immediately; the blocking client call runs
//! as a unit of work on a [`Dispatcher`] lane, and every successful
//! operation is announced as an [`Event`] on a `/container/key` topic.
//!
//! ## Core Concepts
//!
//! - [`Promise`] = one future result, settled exactly once
//! - [`Composable`] = a stream of values whose stages run on a dispatcher
//! - [`Dispatcher`] = where work runs: inline, on a pool, or on one ordered lane
//! - [`SelectorRegistry`] = payloads keyed by exact names or `{var}` templates
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ store / fetch / delete
//!   ▼
//! CommandFacade ──► Promise ◄──────────────────────────┐
//!   │                                                   │
//!   │ resource cache (SelectorRegistry, exact names)    │
//!   ▼                                                   │
//! Dispatcher lane                                       │
//!   │                                                   │
//!   ├─► StoreClient.acquire()   (cache miss only)       │
//!   ├─► Resource.*_operation().execute()                │
//!   ├─► TopicBus.publish("/container/key") ─► handlers  │
//!   └─► settle ─────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Never blocks**: only `await_timeout`/`wait`/`collect*` wait
//! - **Events follow success**: a failed operation publishes nothing; a
//!   successful one publishes before its promise completes
//! - **One acquisition per resource**: concurrent misses for one name share
//!   a single client call
//! - **Ordered lane**: with the default sequential strategy, operations run
//!   one at a time in submission order
//! - **Timeouts are local**: a timed-out wait never cancels the work
//!
//! ## Example
//!
//! ```ignore
//! use relay::{CommandFacade, EventKind, RelayConfig};
//! use std::sync::Arc;
//!
//! let relay = CommandFacade::with_config(Arc::new(client), RelayConfig::from_env()?)?;
//!
//! relay.subscribe("/orders/{key}", |event, bindings| {
//!     if event.kind == EventKind::Delete {
//!         tracing::info!(order = bindings.get("key"), "order removed");
//!     }
//! });
//!
//! relay.store("orders", "42", "pending".to_string());
//! let status = relay
//!     .fetch::<String>("orders", "42")
//!     .await_timeout(relay.config().await_timeout)?;
//! relay.delete("orders", "42");
//!
//! relay.shutdown();
//! ```

// Core modules
mod bus;
mod client;
mod codec;
mod composable;
mod config;
mod dispatch;
mod error;
mod event;
mod facade;
mod promise;
mod repository;
mod selector;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export async result types
pub use composable::{Composable, Signal};
pub use promise::Promise;

// Re-export dispatcher types
pub use dispatch::{Dispatcher, Strategy, Unit};

// Re-export error types
pub use error::{Cause, DispatchFault, RelayError};

// Re-export selector types
pub use selector::{
    Bindings, Match, Registration, RegistrationId, Select, Selector, SelectorRegistry, Template,
};

// Re-export event types
pub use bus::{Subscription, TopicBus};
pub use event::{topic, Deleted, Event, EventKind, Merge};

// Re-export store client interfaces
pub use client::{
    operation, BoxOperation, DeleteRequest, FetchRequest, Operation, OperationFn, RawMutation,
    RawObject, RawResolver, Resource, Retrier, StoreClient, StoreRequest,
};
pub use codec::{BytesCodec, Codec, Json, JsonCodec, Storable, TextCodec};

// Re-export facade types (primary entry point)
pub use config::RelayConfig;
pub use facade::{
    CommandFacade, DeleteOptions, FetchOptions, Mutation, OperationContext, Resolver,
    StoreOptions,
};

// Re-export repository types
pub use repository::{
    ComposableRepository, CrudMethod, CrudRepository, Finder, RepositoryBuilder, Route,
};
