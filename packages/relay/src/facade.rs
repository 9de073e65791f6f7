//! Non-blocking command facade over a key-value store client.
//!
//! # Architecture
//!
//! ```text
//! caller ──store/fetch/delete──► CommandFacade ──► Promise (returned at once)
//!                                    │
//!                                    │ 1. resource cache lookup (caller thread)
//!                                    ▼
//!                              Dispatcher lane (one unit per call)
//!                                    │ 2. acquire + cache on miss (exactly once per name)
//!                                    │ 3. build operation, execute
//!                                    │ 4. publish Event on /container/key
//!                                    ▼
//!                              Promise settled
//! ```
//!
//! Every blocking call to the client runs on the facade's dispatcher lane;
//! none of the public operations block. With the default sequential lane,
//! operations run one at a time in submission order, and the event of one
//! operation is delivered before the next operation starts.
//!
//! # Example
//!
//! ```ignore
//! let relay = CommandFacade::new(Arc::new(client))?;
//!
//! relay.subscribe("/users/{key}", |event, bindings| {
//!     tracing::info!(key = bindings.get("key"), kind = %event.kind, "user changed");
//! });
//!
//! relay.store("users", "ada", "Ada Lovelace".to_string());
//! let name = relay.fetch::<String>("users", "ada").await_timeout(timeout)?;
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::bus::{Subscription, TopicBus};
use crate::client::{
    BoxOperation, DeleteRequest, FetchRequest, RawMutation, RawObject, RawResolver, Resource,
    Retrier, StoreClient, StoreRequest,
};
use crate::codec::{decode_object, encode_object, Codec, Storable};
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::error::{panic_message, Cause, RelayError};
use crate::event::{topic, Deleted, Event, EventKind, Merge};
use crate::promise::Promise;
use crate::selector::{Bindings, Selector, SelectorRegistry};

/// Container and key an operation targets, handed to resolvers and
/// mutations alongside the values they work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub container: String,
    /// `None` for a container-level store before the key is assigned.
    pub key: Option<String>,
}

impl OperationContext {
    pub fn new(container: impl Into<String>, key: Option<String>) -> Self {
        Self {
            container: container.into(),
            key,
        }
    }

    pub fn topic(&self) -> String {
        topic(&self.container, self.key.as_deref())
    }

    fn failure(&self, kind: &'static str, cause: anyhow::Error) -> RelayError {
        RelayError::Operation {
            kind,
            container: self.container.clone(),
            topic: self.topic(),
            cause: Cause::new(cause),
        }
    }
}

/// Picks one value out of conflicting siblings.
pub type Resolver<T> = Arc<dyn Fn(&[T], &OperationContext) -> anyhow::Result<T> + Send + Sync>;

/// Turns the current value (if any) into the value to store.
pub type Mutation<T> = Arc<dyn Fn(Option<T>, &OperationContext) -> anyhow::Result<T> + Send + Sync>;

/// Optional collaborators for a store.
pub struct StoreOptions<T> {
    resolver: Option<Resolver<T>>,
    mutation: Option<Mutation<T>>,
    codec: Option<Arc<dyn Codec<T>>>,
    retrier: Option<Retrier>,
}

impl<T> Default for StoreOptions<T> {
    fn default() -> Self {
        Self {
            resolver: None,
            mutation: None,
            codec: None,
            retrier: None,
        }
    }
}

impl<T> StoreOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&[T], &OperationContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_mutation<F>(mut self, mutation: F) -> Self
    where
        F: Fn(Option<T>, &OperationContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.mutation = Some(Arc::new(mutation));
        self
    }

    pub fn with_codec(mut self, codec: impl Codec<T>) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(retrier);
        self
    }
}

/// Optional collaborators for a fetch.
pub struct FetchOptions<T> {
    resolver: Option<Resolver<T>>,
    codec: Option<Arc<dyn Codec<T>>>,
    retrier: Option<Retrier>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self {
            resolver: None,
            codec: None,
            retrier: None,
        }
    }
}

impl<T> FetchOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&[T], &OperationContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_codec(mut self, codec: impl Codec<T>) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(retrier);
        self
    }
}

/// Optional collaborators for a delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    retrier: Option<Retrier>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(retrier);
        self
    }
}

struct Shared<C: StoreClient> {
    client: Arc<C>,
    lane: Dispatcher,
    /// Acquired resources, keyed by exact container name.
    resources: SelectorRegistry<Arc<C::Resource>>,
    /// One gate per container with an acquisition in flight.
    acquiring: DashMap<String, Arc<Mutex<()>>>,
    bus: TopicBus,
    config: RelayConfig,
}

impl<C: StoreClient> Shared<C> {
    fn cached(&self, name: &str) -> Option<Arc<C::Resource>> {
        self.resources
            .select(name)
            .next()
            .map(|matched| matched.payload().clone())
    }

    /// Return the cached resource, acquiring it first if needed.
    ///
    /// Concurrent misses for one name serialize on that name's gate; only
    /// the first acquires, the rest find it in the cache.
    fn resource(&self, name: &str) -> Result<Arc<C::Resource>, RelayError> {
        if let Some(resource) = self.cached(name) {
            return Ok(resource);
        }

        let gate = self
            .acquiring
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let held = gate.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(resource) = self.cached(name) {
            return Ok(resource);
        }

        let acquired = self.client.acquire(name).map(Arc::new);
        if let Ok(resource) = &acquired {
            self.resources
                .register(Selector::exact(name), resource.clone());
            debug!(container = %name, "resource acquired and cached");
        }
        drop(held);
        self.acquiring.remove(name);

        acquired.map_err(|e| RelayError::Acquisition {
            name: name.to_string(),
            cause: Cause::new(e),
        })
    }

    fn publish(&self, event: Event) {
        self.bus.publish(&event);
    }
}

/// Promise-returning store/fetch/delete over a [`StoreClient`].
///
/// Cloning a `CommandFacade` yields another handle to the same lane, cache
/// and subscribers.
pub struct CommandFacade<C: StoreClient> {
    shared: Arc<Shared<C>>,
}

impl<C: StoreClient> Clone for CommandFacade<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: StoreClient> CommandFacade<C> {
    /// Create a facade with the default configuration: a sequential lane
    /// named `relay-io`.
    pub fn new(client: Arc<C>) -> Result<Self> {
        Self::with_config(client, RelayConfig::default())
    }

    /// Create a facade whose lane is built from `config`.
    pub fn with_config(client: Arc<C>, config: RelayConfig) -> Result<Self> {
        let lane = config.dispatcher()?;
        Ok(Self::build(client, lane, config))
    }

    /// Create a facade on an existing dispatcher.
    pub fn with_dispatcher(client: Arc<C>, dispatcher: Dispatcher) -> Self {
        let config = RelayConfig::default()
            .with_strategy(dispatcher.strategy())
            .with_lane_name(dispatcher.name());
        let config = match dispatcher.queue_capacity() {
            Some(capacity) => config.with_queue_capacity(capacity),
            None => config,
        };
        Self::build(client, dispatcher, config)
    }

    fn build(client: Arc<C>, lane: Dispatcher, config: RelayConfig) -> Self {
        debug!(lane = %lane.name(), strategy = %lane.strategy(), "command facade ready");
        Self {
            shared: Arc::new(Shared {
                client,
                bus: TopicBus::with_dispatcher(lane.clone()),
                lane,
                resources: SelectorRegistry::new(),
                acquiring: DashMap::new(),
                config,
            }),
        }
    }

    /// Look up a resource by name, acquiring it on the lane on first use.
    pub fn fetch_resource(&self, name: &str) -> Promise<Arc<C::Resource>> {
        if let Some(resource) = self.shared.cached(name) {
            return Promise::completed(resource);
        }

        let promise = self.shared.lane.promise();
        let target = promise.clone();
        let shared = self.shared.clone();
        let name = name.to_string();
        let scheduled = self
            .shared
            .lane
            .schedule(move || target.deliver(shared.resource(&name)));
        if let Err(e) = scheduled {
            promise.deliver(Err(e));
        }
        promise
    }

    /// Store `value` under `container/key` with the type's default codec.
    pub fn store<T: Storable>(&self, container: &str, key: &str, value: T) -> Promise<T> {
        self.store_with(container, Some(key), value, StoreOptions::default())
    }

    /// Store `value`, letting the store assign a key when `key` is `None`.
    ///
    /// The store event is published on the assigned key's topic.
    pub fn store_with<T: Storable>(
        &self,
        container: &str,
        key: Option<&str>,
        value: T,
        options: StoreOptions<T>,
    ) -> Promise<T> {
        let context = OperationContext::new(container, key.map(str::to_string));
        self.run(context, move |shared, resource, context| {
            let codec = options.codec.unwrap_or_else(T::codec);
            let merged = MergeSlot::default();
            let mut request = StoreRequest::new(
                context.key.clone(),
                encode_object(&*codec, context.key.clone(), &value)?,
            );
            request.resolver = options
                .resolver
                .map(|resolver| raw_resolver(resolver, codec.clone(), merged.clone(), context.clone()));
            request.mutation = options
                .mutation
                .map(|mutation| raw_mutation(mutation, codec.clone(), context.clone()));
            request.retrier = options.retrier;

            let stored = resource
                .store_operation(request)
                .execute()
                .map_err(|e| context.failure("store", e))?;
            let stored_value = decode_object(&*codec, &stored)?;
            let key = stored.key.or_else(|| context.key.clone());

            trace!(container = %context.container, key = ?key, "stored");
            merged.publish(shared, &context.container, key.clone());
            shared.publish(Event::new(
                EventKind::Store,
                context.container.clone(),
                key,
                stored_value.clone(),
            ));
            Ok(stored_value)
        })
    }

    /// Fetch the value at `container/key`. An absent key yields `None`.
    pub fn fetch<T: Storable>(&self, container: &str, key: &str) -> Promise<Option<T>> {
        self.fetch_with(container, key, FetchOptions::default())
    }

    pub fn fetch_with<T: Storable>(
        &self,
        container: &str,
        key: &str,
        options: FetchOptions<T>,
    ) -> Promise<Option<T>> {
        let context = OperationContext::new(container, Some(key.to_string()));
        let key = key.to_string();
        self.run(context, move |shared, resource, context| {
            let codec = options.codec.unwrap_or_else(T::codec);
            let merged = MergeSlot::default();
            let mut request = FetchRequest::new(key.clone());
            request.resolver = options
                .resolver
                .map(|resolver| raw_resolver(resolver, codec.clone(), merged.clone(), context.clone()));
            request.retrier = options.retrier;

            let fetched = resource
                .fetch_operation(request)
                .execute()
                .map_err(|e| context.failure("fetch", e))?;
            let value = match &fetched {
                Some(object) => Some(decode_object(&*codec, object)?),
                None => None,
            };

            trace!(container = %context.container, key = %key, found = value.is_some(), "fetched");
            merged.publish(shared, &context.container, Some(key.clone()));
            shared.publish(Event::new(
                EventKind::Fetch,
                context.container.clone(),
                Some(key),
                value.clone(),
            ));
            Ok(value)
        })
    }

    /// Delete the value at `container/key`. Deleting a missing key succeeds.
    pub fn delete(&self, container: &str, key: &str) -> Promise<()> {
        self.delete_with(container, key, DeleteOptions::default())
    }

    pub fn delete_with(&self, container: &str, key: &str, options: DeleteOptions) -> Promise<()> {
        let context = OperationContext::new(container, Some(key.to_string()));
        let key = key.to_string();
        self.run(context, move |shared, resource, context| {
            let mut request = DeleteRequest::new(key.clone());
            request.retrier = options.retrier;

            resource
                .delete_operation(request)
                .execute()
                .map_err(|e| context.failure("delete", e))?;

            trace!(container = %context.container, key = %key, "deleted");
            shared.publish(Event::new(
                EventKind::Delete,
                context.container.clone(),
                Some(key.clone()),
                Deleted {
                    container: context.container.clone(),
                    key,
                },
            ));
            Ok(())
        })
    }

    /// Run a prebuilt operation on the lane. No event is published.
    pub fn send<T>(&self, operation: BoxOperation<T>) -> Promise<T>
    where
        T: Clone + Send + 'static,
    {
        self.shared
            .lane
            .submit(move || operation.execute())
            .map_err_kind(&self.shared.lane)
    }

    /// Run prebuilt operations in order as one unit, stopping at the first
    /// failure.
    pub fn send_all<T>(&self, operations: Vec<BoxOperation<T>>) -> Promise<()>
    where
        T: Send + 'static,
    {
        let total = operations.len();
        self.shared
            .lane
            .submit(move || {
                for (index, operation) in operations.into_iter().enumerate() {
                    operation.execute().map_err(|e| {
                        e.context(format!("operation {} of {} failed", index + 1, total))
                    })?;
                }
                Ok(())
            })
            .map_err_kind(&self.shared.lane)
    }

    /// Subscribe to events whose topic matches `template`.
    pub fn subscribe<F>(&self, template: &str, handler: F) -> Subscription
    where
        F: Fn(&Event, &Bindings) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(template, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.shared.bus.unsubscribe(subscription)
    }

    pub fn bus(&self) -> &TopicBus {
        &self.shared.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.lane
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Number of resources currently cached.
    pub fn cached_resources(&self) -> usize {
        self.shared.resources.len()
    }

    /// Stop the lane after draining queued operations.
    pub fn shutdown(&self) {
        self.shared.lane.shutdown();
    }

    /// Schedule one resource access as a single unit on the lane.
    fn run<T, F>(&self, context: OperationContext, work: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Shared<C>, Arc<C::Resource>, &OperationContext) -> Result<T, RelayError>
            + Send
            + 'static,
    {
        let promise = self.shared.lane.promise();
        let target = promise.clone();
        let shared = self.shared.clone();
        let cached = self.shared.cached(&context.container);

        let scheduled = self.shared.lane.schedule(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let resource = match cached {
                    Some(resource) => resource,
                    None => shared.resource(&context.container)?,
                };
                work(&shared, resource, &context)
            }))
            .unwrap_or_else(|payload| Err(RelayError::panicked(&panic_message(&payload))));

            if let Err(e) = &outcome {
                trace!(topic = %context.topic(), error = %e, "operation failed");
            }
            target.deliver(outcome);
        });
        if let Err(e) = scheduled {
            promise.deliver(Err(e));
        }
        promise
    }
}

/// The last sibling resolution of one operation, held until the operation
/// has succeeded. A retried attempt overwrites the previous one.
struct MergeSlot<T>(Arc<Mutex<Option<Merge<T>>>>);

impl<T> Default for MergeSlot<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl<T> Clone for MergeSlot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Storable> MergeSlot<T> {
    fn record(&self, merge: Merge<T>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(merge);
    }

    /// Publish the recorded resolution, if any, on the operation's topic.
    fn publish<C: StoreClient>(&self, shared: &Shared<C>, container: &str, key: Option<String>) {
        let merge = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(merge) = merge {
            shared.publish(Event::new(EventKind::Merge, container, key, merge));
        }
    }
}

/// Wrap a typed resolver for the raw operation layer. Each resolution is
/// recorded in `merged`; publishing it is left to the operation.
fn raw_resolver<T: Storable>(
    resolver: Resolver<T>,
    codec: Arc<dyn Codec<T>>,
    merged: MergeSlot<T>,
    context: OperationContext,
) -> RawResolver {
    Arc::new(move |siblings: &[RawObject]| -> anyhow::Result<RawObject> {
        let decoded = siblings
            .iter()
            .map(|sibling| codec.decode(&sibling.value))
            .collect::<anyhow::Result<Vec<T>>>()?;
        let resolved = resolver(&decoded, &context)?;
        let key = siblings
            .iter()
            .find_map(|sibling| sibling.key.clone())
            .or_else(|| context.key.clone());
        let object = RawObject {
            key: key.clone(),
            content_type: codec.content_type().to_string(),
            value: codec.encode(&resolved)?,
        };

        debug!(container = %context.container, key = ?key, siblings = decoded.len(), "siblings resolved");
        merged.record(Merge {
            siblings: decoded,
            resolved,
        });
        Ok(object)
    })
}

fn raw_mutation<T: Storable>(
    mutation: Mutation<T>,
    codec: Arc<dyn Codec<T>>,
    context: OperationContext,
) -> RawMutation {
    Arc::new(move |current: Option<&RawObject>| -> anyhow::Result<RawObject> {
        let current = current.map(|object| codec.decode(&object.value)).transpose()?;
        let next = mutation(current, &context)?;
        Ok(RawObject {
            key: context.key.clone(),
            content_type: codec.content_type().to_string(),
            value: codec.encode(&next)?,
        })
    })
}

/// Reclassify dispatcher-level failures of prebuilt operations as
/// operation errors.
trait OperationOutcome<T> {
    fn map_err_kind(self, lane: &Dispatcher) -> Promise<T>;
}

impl<T: Clone + Send + 'static> OperationOutcome<T> for Promise<T> {
    fn map_err_kind(self, lane: &Dispatcher) -> Promise<T> {
        let derived = lane.promise();
        let target = derived.clone();
        self.on_complete(move |outcome| {
            let outcome = match outcome {
                Ok(value) => Ok(value.clone()),
                Err(RelayError::Callback { cause }) => Err(RelayError::Operation {
                    kind: "send",
                    container: "*".to_string(),
                    topic: "*".to_string(),
                    cause: cause.clone(),
                }),
                Err(other) => Err(other.clone()),
            };
            target.deliver(outcome);
        });
        derived
    }
}

impl<C: StoreClient> fmt::Debug for CommandFacade<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFacade")
            .field("lane", &self.shared.lane)
            .field("cached_resources", &self.shared.resources.len())
            .field("subscribers", &self.shared.bus.subscriber_count())
            .finish()
    }
}
