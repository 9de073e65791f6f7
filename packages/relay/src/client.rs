//! Contract between the facade and a key-value store client.
//!
//! The facade never talks to a store directly. It asks a [`StoreClient`]
//! for a named [`Resource`] (a bucket, a table, a namespace), asks the
//! resource to build an [`Operation`] for each request, and runs that
//! operation on its dispatcher lane. Everything here is blocking; the lane
//! is what keeps callers from blocking on it.
//!
//! Operations move raw bytes only. Typed values are converted at the
//! facade boundary by a [`Codec`](crate::codec::Codec).

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

/// A stored value as the store sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    /// Assigned key; `None` on a store request that lets the store choose.
    pub key: Option<String>,
    pub content_type: String,
    pub value: Vec<u8>,
}

impl RawObject {
    pub fn new(content_type: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            content_type: content_type.into(),
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// The value as UTF-8 text.
    pub fn as_text(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.value).context("object value is not UTF-8")
    }
}

/// Chooses one object out of conflicting siblings.
pub type RawResolver = Arc<dyn Fn(&[RawObject]) -> anyhow::Result<RawObject> + Send + Sync>;

/// Rewrites the current object (if any) into the object to store.
pub type RawMutation = Arc<dyn Fn(Option<&RawObject>) -> anyhow::Result<RawObject> + Send + Sync>;

/// Retry policy attached to an operation.
///
/// The operation decides what is retryable; [`Retrier::run`] is a helper
/// for the common "retry everything" case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retrier {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Retrier {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `attempt` up to `attempts` times, sleeping `backoff` between
    /// failures. Returns the last error if every attempt fails.
    pub fn run<T>(&self, mut attempt: impl FnMut(u32) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut tried = 1;
        loop {
            match attempt(tried) {
                Ok(value) => return Ok(value),
                Err(e) if tried >= self.attempts => {
                    return Err(e.context(format!("gave up after {} attempts", tried)))
                }
                Err(e) => {
                    debug!(attempt = tried, error = %e, "operation failed, retrying");
                    tried += 1;
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                }
            }
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(10))
    }
}

/// Request to store an object.
#[derive(Clone)]
pub struct StoreRequest {
    /// Target key; `None` asks the store to assign one.
    pub key: Option<String>,
    pub object: RawObject,
    pub resolver: Option<RawResolver>,
    /// Applied to the current object instead of storing `object` verbatim.
    pub mutation: Option<RawMutation>,
    pub retrier: Option<Retrier>,
}

impl StoreRequest {
    pub fn new(key: Option<String>, object: RawObject) -> Self {
        Self {
            key,
            object,
            resolver: None,
            mutation: None,
            retrier: None,
        }
    }
}

impl fmt::Debug for StoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRequest")
            .field("key", &self.key)
            .field("content_type", &self.object.content_type)
            .field("resolver", &self.resolver.is_some())
            .field("mutation", &self.mutation.is_some())
            .field("retrier", &self.retrier)
            .finish()
    }
}

/// Request to fetch the object at a key.
#[derive(Clone)]
pub struct FetchRequest {
    pub key: String,
    pub resolver: Option<RawResolver>,
    pub retrier: Option<Retrier>,
}

impl FetchRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            resolver: None,
            retrier: None,
        }
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("key", &self.key)
            .field("resolver", &self.resolver.is_some())
            .field("retrier", &self.retrier)
            .finish()
    }
}

/// Request to delete the object at a key.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub key: String,
    pub retrier: Option<Retrier>,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            retrier: None,
        }
    }
}

/// A prepared, blocking store call.
pub trait Operation: Send {
    type Output;

    fn execute(self: Box<Self>) -> anyhow::Result<Self::Output>;
}

/// Boxed operation yielding `T`.
pub type BoxOperation<T> = Box<dyn Operation<Output = T>>;

/// Adapts a closure into an [`Operation`].
pub struct OperationFn<F>(F);

impl<T, F> Operation for OperationFn<F>
where
    F: FnOnce() -> anyhow::Result<T> + Send,
{
    type Output = T;

    fn execute(self: Box<Self>) -> anyhow::Result<T> {
        (self.0)()
    }
}

/// Box a closure as an operation.
pub fn operation<T, F>(f: F) -> BoxOperation<T>
where
    T: 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    Box::new(OperationFn(f))
}

/// A named container of objects.
pub trait Resource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Build a store operation. Its output is the object as stored, with
    /// the assigned key filled in.
    fn store_operation(&self, request: StoreRequest) -> BoxOperation<RawObject>;

    /// Build a fetch operation. An absent key yields `Ok(None)`.
    fn fetch_operation(&self, request: FetchRequest) -> BoxOperation<Option<RawObject>>;

    fn delete_operation(&self, request: DeleteRequest) -> BoxOperation<()>;
}

/// A connection to a key-value store.
pub trait StoreClient: Send + Sync + 'static {
    type Resource: Resource;

    /// Look up or create the resource called `name`. Blocking.
    fn acquire(&self, name: &str) -> anyhow::Result<Self::Resource>;
}
