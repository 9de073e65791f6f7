//! Single-assignment asynchronous result container.
//!
//! A [`Promise`] starts pending and settles exactly once, either with a value
//! or with a [`RelayError`]. Settling wakes every blocked
//! [`await_timeout`](Promise::await_timeout) caller, every async
//! [`wait`](Promise::wait)er, and runs the registered callbacks in
//! registration order.
//!
//! # Guarantees
//!
//! - **At-most-once completion**: the first `complete`/`fail` wins; later
//!   attempts return [`RelayError::AlreadyCompleted`] and leave the stored
//!   outcome untouched
//! - **No lost callbacks**: a callback registered after settlement runs
//!   immediately on the registering thread
//! - **Timeouts are local**: a timed-out wait does not change the promise;
//!   a later completion is still observed by later waiters
//!
//! # Example
//!
//! ```ignore
//! let promise = dispatcher.submit(|| Ok(compute()));
//!
//! promise
//!     .on_success(|v| tracing::info!(value = ?v, "done"))
//!     .on_error(|e| tracing::warn!(error = %e, "failed"));
//!
//! let value = promise.await_timeout(Duration::from_secs(5))?;
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, warn};

use crate::dispatch::Dispatcher;
use crate::error::{panic_message, RelayError};

type Callback<T> = Box<dyn FnOnce(&Result<T, RelayError>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T, RelayError>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes blocking waiters.
    settled: Condvar,
    /// Wakes async waiters.
    notify: Notify,
    /// Receives faults raised by callbacks.
    dispatcher: Option<Dispatcher>,
}

/// Single-assignment async result.
///
/// Cloning a `Promise` yields another handle to the same slot.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a pending promise with no owning dispatcher.
    ///
    /// Callback panics are logged instead of being published as faults.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a pending promise whose callback faults are reported to
    /// `dispatcher`.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self::build(Some(dispatcher))
    }

    /// Create a promise that is already completed with `value`.
    pub fn completed(value: T) -> Self {
        Self::build_done(Ok(value))
    }

    /// Create a promise that is already failed with `error`.
    pub fn failed(error: RelayError) -> Self {
        Self::build_done(Err(error))
    }

    fn build(dispatcher: Option<Dispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                settled: Condvar::new(),
                notify: Notify::new(),
                dispatcher,
            }),
        }
    }

    fn build_done(outcome: Result<T, RelayError>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Done(outcome)),
                settled: Condvar::new(),
                notify: Notify::new(),
                dispatcher: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A callback never runs under this lock, so poisoning can only come
        // from a panic in our own bookkeeping; the state is still coherent.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the promise with a value.
    pub fn complete(&self, value: T) -> Result<(), RelayError> {
        self.settle(Ok(value))
    }

    /// Fail the promise with an error.
    pub fn fail(&self, error: RelayError) -> Result<(), RelayError> {
        self.settle(Err(error))
    }

    /// Settle the promise from a `Result`.
    ///
    /// Returns [`RelayError::AlreadyCompleted`] if the promise already has an
    /// outcome; the stored outcome is never overwritten.
    pub fn settle(&self, outcome: Result<T, RelayError>) -> Result<(), RelayError> {
        let callbacks = {
            let mut state = self.lock();
            match &mut *state {
                State::Done(_) => return Err(RelayError::AlreadyCompleted),
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(outcome.clone());
                    callbacks
                }
            }
        };

        self.shared.settled.notify_all();
        self.shared.notify.notify_waiters();

        for callback in callbacks {
            self.invoke(callback, &outcome);
        }
        Ok(())
    }

    /// Settle the promise, logging instead of returning a double completion.
    ///
    /// Used by scheduled work that owns the only producer handle.
    pub(crate) fn deliver(&self, outcome: Result<T, RelayError>) {
        if let Err(e) = self.settle(outcome) {
            warn!(error = %e, "dropping outcome for already settled promise");
        }
    }

    fn invoke(&self, callback: Callback<T>, outcome: &Result<T, RelayError>) {
        let result = catch_unwind(AssertUnwindSafe(|| callback(outcome)));
        if let Err(payload) = result {
            let message = panic_message(&payload);
            match &self.shared.dispatcher {
                Some(dispatcher) => dispatcher.report_fault("promise callback", message),
                None => error!(panic = %message, "promise callback panicked"),
            }
        }
    }

    /// Register a callback for either outcome.
    pub fn on_complete<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Result<T, RelayError>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return self;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        self.invoke(Box::new(callback), &outcome);
        self
    }

    /// Register a callback that runs only if the promise completes.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Ok(value) = outcome {
                callback(value);
            }
        })
    }

    /// Register a callback that runs only if the promise fails.
    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&RelayError) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Err(error) = outcome {
                callback(error);
            }
        })
    }

    /// Derive a promise holding `f` applied to this promise's value.
    ///
    /// Runs on whichever thread settles this promise. Errors pass through
    /// unchanged; an error or panic from `f` fails the derived promise.
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let derived = Promise::build(self.shared.dispatcher.clone());
        let target = derived.clone();
        self.on_complete(move |outcome| {
            let next = match outcome {
                Ok(value) => {
                    let value = value.clone();
                    match catch_unwind(AssertUnwindSafe(move || f(value))) {
                        Ok(Ok(mapped)) => Ok(mapped),
                        Ok(Err(e)) => Err(RelayError::callback(e)),
                        Err(payload) => Err(RelayError::panicked(&panic_message(&payload))),
                    }
                }
                Err(e) => Err(e.clone()),
            };
            target.deliver(next);
        });
        derived
    }

    /// Block the calling thread until the promise settles or `timeout`
    /// elapses.
    ///
    /// On timeout the promise stays pending and
    /// [`RelayError::Timeout`] is returned.
    pub fn await_timeout(&self, timeout: Duration) -> Result<T, RelayError> {
        let state = self.lock();
        let (state, _) = self
            .shared
            .settled
            .wait_timeout_while(state, timeout, |s| matches!(s, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            State::Done(outcome) => outcome.clone(),
            State::Pending(_) => Err(RelayError::Timeout { duration: timeout }),
        }
    }

    /// Wait asynchronously until the promise settles or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<T, RelayError> {
        match tokio::time::timeout(timeout, self.settled()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RelayError::Timeout { duration: timeout }),
        }
    }

    async fn settled(&self) -> Result<T, RelayError> {
        loop {
            // Register for notification BEFORE checking state so a settle
            // between the check and the await is not missed
            let notified = self.shared.notify.notified();

            if let Some(outcome) = self.peek() {
                return outcome;
            }

            notified.await;
        }
    }

    /// The outcome, if the promise has settled.
    pub fn peek(&self) -> Option<Result<T, RelayError>> {
        match &*self.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Returns true while no outcome has been stored.
    pub fn is_pending(&self) -> bool {
        matches!(&*self.lock(), State::Pending(_))
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            State::Pending(callbacks) => format!("pending ({} callbacks)", callbacks.len()),
            State::Done(Ok(_)) => "completed".to_string(),
            State::Done(Err(e)) => format!("failed: {}", e),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn boom() -> RelayError {
        RelayError::callback(anyhow::anyhow!("boom"))
    }

    #[test]
    fn test_complete_then_await() {
        let promise = Promise::new();
        promise.complete(42).unwrap();
        assert_eq!(promise.await_timeout(Duration::from_millis(10)).unwrap(), 42);
        assert!(!promise.is_pending());
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let promise = Promise::new();
        promise.complete("first").unwrap();

        assert!(matches!(
            promise.complete("second"),
            Err(RelayError::AlreadyCompleted)
        ));
        assert!(matches!(promise.fail(boom()), Err(RelayError::AlreadyCompleted)));

        assert_eq!(
            promise.await_timeout(Duration::from_millis(10)).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_fail_then_await_returns_error() {
        let promise: Promise<u32> = Promise::new();
        promise.fail(boom()).unwrap();
        let err = promise.await_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_concurrent_completion_has_one_winner() {
        let promise = Promise::new();
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let promise = promise.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if promise.complete(i).is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        Some(i)
                    } else {
                        None
                    }
                })
            })
            .collect();

        let winner: Vec<usize> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(winner.len(), 1);
        assert_eq!(
            promise.await_timeout(Duration::from_millis(10)).unwrap(),
            winner[0]
        );
    }

    #[test]
    fn test_callbacks_run_once_in_registration_order() {
        let promise = Promise::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            promise.on_success(move |v: &u32| seen.lock().unwrap().push((tag, *v)));
        }

        promise.complete(7).unwrap();
        let _ = promise.complete(8);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 7), ("b", 7), ("c", 7)]
        );
    }

    #[test]
    fn test_late_callback_fires_immediately() {
        let promise = Promise::completed(5);
        let hit = Arc::new(AtomicUsize::new(0));
        let hit_clone = hit.clone();

        promise.on_success(move |v| {
            hit_clone.fetch_add(*v, Ordering::SeqCst);
        });

        assert_eq!(hit.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_on_error_skips_success_and_vice_versa() {
        let ok_hits = Arc::new(AtomicUsize::new(0));
        let err_hits = Arc::new(AtomicUsize::new(0));

        let promise: Promise<u8> = Promise::new();
        {
            let ok_hits = ok_hits.clone();
            let err_hits = err_hits.clone();
            promise
                .on_success(move |_| {
                    ok_hits.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    err_hits.fetch_add(1, Ordering::SeqCst);
                });
        }
        promise.fail(boom()).unwrap();

        assert_eq!(ok_hits.load(Ordering::SeqCst), 0);
        assert_eq!(err_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_does_not_lose_late_result() {
        let promise = Promise::new();

        let err = promise.await_timeout(Duration::from_millis(1)).unwrap_err();
        assert!(err.is_timeout());
        assert!(promise.is_pending());

        let producer = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete("late").unwrap();
        });

        assert_eq!(promise.await_timeout(Duration::from_secs(5)).unwrap(), "late");
        handle.join().unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_reach_completer() {
        let promise = Promise::new();
        let after = Arc::new(AtomicUsize::new(0));
        let after_clone = after.clone();

        promise.on_success(|_: &u8| panic!("callback exploded"));
        promise.on_success(move |_| {
            after_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(promise.complete(1).is_ok());
        // Later callbacks still run
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_reported_to_dispatcher() {
        let dispatcher = Dispatcher::immediate("faults");
        let mut faults = dispatcher.faults();

        let promise = dispatcher.promise::<u8>();
        promise.on_success(|_| panic!("bad subscriber"));
        promise.complete(1).unwrap();

        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.origin, "promise callback");
        assert!(fault.message.contains("bad subscriber"));
    }

    #[test]
    fn test_map_transforms_and_propagates() {
        let promise = Promise::new();
        let doubled = promise.map(|v: u32| Ok(v * 2));
        let failing = promise.map(|_: u32| -> anyhow::Result<u32> { anyhow::bail!("nope") });

        promise.complete(21).unwrap();

        assert_eq!(doubled.await_timeout(Duration::from_millis(10)).unwrap(), 42);
        assert!(matches!(
            failing.await_timeout(Duration::from_millis(10)),
            Err(RelayError::Callback { .. })
        ));

        let upstream: Promise<u32> = Promise::new();
        let mapped = upstream.map(|v| Ok(v + 1));
        upstream.fail(boom()).unwrap();
        assert!(mapped
            .await_timeout(Duration::from_millis(10))
            .unwrap_err()
            .to_string()
            .contains("boom"));
    }

    #[test]
    fn test_peek_and_debug() {
        let promise: Promise<u8> = Promise::new();
        assert!(promise.peek().is_none());
        assert!(format!("{:?}", promise).contains("pending"));

        promise.complete(3).unwrap();
        assert_eq!(promise.peek().unwrap().unwrap(), 3);
        assert!(format!("{:?}", promise).contains("completed"));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let promise = Promise::new();
        let producer = promise.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.complete(99u64).unwrap();
        });

        assert_eq!(promise.wait(Duration::from_secs(5)).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_async_wait_timeout_leaves_promise_pending() {
        let promise: Promise<u8> = Promise::new();
        let err = promise.wait(Duration::from_millis(5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(promise.is_pending());

        promise.complete(1).unwrap();
        assert_eq!(promise.wait(Duration::from_millis(5)).await.unwrap(), 1);
    }
}
