//! Dispatcher-driven value pipelines.
//!
//! A [`Composable`] is a stream of values that ends in exactly one terminal
//! signal: completion or failure. Stages derived with [`map`](Composable::map)
//! and [`consume`](Composable::consume) run their functions as units on a
//! [`Dispatcher`], so a pipeline's threading is chosen by the dispatcher and
//! not by the producer.
//!
//! ```text
//!   accept(v) ──► history ──► subscribers ──► map(f) ──schedule──► downstream
//!   complete()            (replayed to late     │
//!   fail(e)                subscribers)         └─ completes only after every
//!                                                  scheduled f has finished
//! ```
//!
//! # Guarantees
//!
//! - **Replay**: a subscriber attached late sees every value accepted so far,
//!   in order, then the terminal signal if there is one
//! - **Single terminal**: after `complete` or `fail`, further values and
//!   terminals are dropped
//! - **Ordered fan-out**: each subscriber observes values in acceptance order
//!
//! Each subscriber keeps its own cursor into the history. One thread at a
//! time drains pending signals and invokes subscribers with no lock held, so
//! a subscriber may attach new subscribers or feed values back into the
//! stream it observes; those signals are picked up by the ongoing drain.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::dispatch::Dispatcher;
use crate::error::{panic_message, RelayError};

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    Next(T),
    Error(RelayError),
    Complete,
}

type Subscriber<T> = Arc<dyn Fn(Signal<T>) + Send + Sync>;

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(RelayError),
}

struct Cursor<T> {
    subscriber: Subscriber<T>,
    /// Index of the next history entry this subscriber has not seen.
    next: usize,
}

struct StreamState<T> {
    history: Vec<T>,
    terminal: Option<Terminal>,
    subscribers: Vec<Cursor<T>>,
    /// Set while some thread is delivering pending signals.
    draining: bool,
}

impl<T: Clone> StreamState<T> {
    /// Claim the next undelivered signal, if any. A subscriber that is handed
    /// its terminal signal is detached.
    fn next_delivery(&mut self) -> Option<(Subscriber<T>, Signal<T>)> {
        for index in 0..self.subscribers.len() {
            let cursor = &mut self.subscribers[index];
            if let Some(value) = self.history.get(cursor.next) {
                cursor.next += 1;
                return Some((cursor.subscriber.clone(), Signal::Next(value.clone())));
            }
            if let Some(terminal) = &self.terminal {
                let signal = terminal.signal();
                let cursor = self.subscribers.remove(index);
                return Some((cursor.subscriber, signal));
            }
        }
        None
    }

    /// Mark a drain as started. Returns false if one is already running.
    fn begin_drain(&mut self) -> bool {
        !std::mem::replace(&mut self.draining, true)
    }
}

impl Terminal {
    fn signal<T>(&self) -> Signal<T> {
        match self {
            Terminal::Completed => Signal::Complete,
            Terminal::Failed(e) => Signal::Error(e.clone()),
        }
    }
}

struct Shared<T> {
    state: Mutex<StreamState<T>>,
    settled: Condvar,
    notify: Notify,
    dispatcher: Dispatcher,
}

/// A value stream driven by a dispatcher.
///
/// Cloning a `Composable` yields another handle to the same stream; any
/// handle can produce into it.
pub struct Composable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Composable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Tracks in-flight mapped units so downstream completes after the last one.
struct Pending {
    scheduled: AtomicUsize,
    upstream_done: AtomicBool,
}

impl<T: Clone + Send + 'static> Composable<T> {
    /// Create an empty, deferred stream. Values arrive through
    /// [`accept`](Self::accept).
    ///
    /// Every accepted value is kept for replay to late subscribers until the
    /// last handle is dropped, so memory grows with the number of values a
    /// stream carries. Long-lived feeds should be split into bounded streams.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState {
                    history: Vec::new(),
                    terminal: None,
                    subscribers: Vec::new(),
                    draining: false,
                }),
                settled: Condvar::new(),
                notify: Notify::new(),
                dispatcher,
            }),
        }
    }

    /// A stream that emits `value` and completes, as one dispatched unit.
    pub fn from_value(value: T, dispatcher: Dispatcher) -> Self {
        Self::from_values(vec![value], dispatcher)
    }

    /// A stream that emits every item of `values` in order and completes.
    pub fn from_iter<I>(values: I, dispatcher: Dispatcher) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Self::from_values(values.into_iter().collect(), dispatcher)
    }

    fn from_values(values: Vec<T>, dispatcher: Dispatcher) -> Self {
        Self::from_work(dispatcher, move || Ok(values))
    }

    /// A stream fed by `work`, run as one unit on `dispatcher`: each value
    /// it returns is emitted in order, then the stream completes. An error
    /// or panic from `work` fails the stream instead.
    pub fn from_work<F>(dispatcher: Dispatcher, work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Vec<T>> + Send + 'static,
    {
        let composable = Self::new(dispatcher.clone());
        let producer = composable.clone();
        let scheduled = dispatcher.schedule(move || match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(values)) => {
                for value in values {
                    producer.accept(value);
                }
                producer.complete();
            }
            Ok(Err(e)) => {
                producer.fail(RelayError::callback(e));
            }
            Err(payload) => {
                producer.fail(RelayError::panicked(&panic_message(&payload)));
            }
        });
        if let Err(e) = scheduled {
            composable.fail(e);
        }
        composable
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a value into the stream.
    ///
    /// Returns false if the stream already reached a terminal signal; the
    /// value is dropped. Accepted values stay in the replay history for the
    /// lifetime of the stream.
    pub fn accept(&self, value: T) -> bool {
        let drain = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                trace!("dropping value accepted after terminal signal");
                return false;
            }
            state.history.push(value);
            state.begin_drain()
        };
        if drain {
            self.drain();
        }
        true
    }

    /// End the stream successfully. Returns false if it had already ended.
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Completed)
    }

    /// End the stream with `error`. Returns false if it had already ended.
    pub fn fail(&self, error: RelayError) -> bool {
        self.terminate(Terminal::Failed(error))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let drain = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal);
            state.begin_drain()
        };

        self.shared.settled.notify_all();
        self.shared.notify.notify_waiters();

        if drain {
            self.drain();
        }
        true
    }

    /// Deliver pending signals until every subscriber has caught up.
    fn drain(&self) {
        loop {
            let delivery = {
                let mut state = self.lock();
                let delivery = state.next_delivery();
                if delivery.is_none() {
                    state.draining = false;
                }
                delivery
            };
            match delivery {
                Some((subscriber, signal)) => self.invoke(&subscriber, signal),
                None => return,
            }
        }
    }

    fn invoke(&self, subscriber: &Subscriber<T>, signal: Signal<T>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(signal))) {
            self.shared
                .dispatcher
                .report_fault("composable subscriber", panic_message(&payload));
        }
    }

    /// Attach a subscriber, replaying history and any terminal signal.
    ///
    /// Called from inside another subscriber of the same stream, the replay
    /// happens after that subscriber returns.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(Signal<T>) + Send + Sync + 'static,
    {
        let drain = {
            let mut state = self.lock();
            state.subscribers.push(Cursor {
                subscriber: Arc::new(subscriber),
                next: 0,
            });
            state.begin_drain()
        };
        if drain {
            self.drain();
        }
    }


    /// Derive a stream of `f` applied to each value, run on this stream's
    /// dispatcher.
    ///
    /// An error or panic from `f` fails the derived stream. The derived
    /// stream completes once this one has completed and every scheduled
    /// `f` has finished.
    pub fn map<U, F>(&self, f: F) -> Composable<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        self.map_on(self.shared.dispatcher.clone(), f)
    }

    /// Like [`map`](Self::map), but run `f` on `dispatcher`.
    pub fn map_on<U, F>(&self, dispatcher: Dispatcher, f: F) -> Composable<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        self.derive(dispatcher, move |value| f(value).map(|mapped| vec![mapped]))
    }

    /// Derive a stream where each value expands into zero or more values,
    /// run on `dispatcher`.
    pub fn flat_map_on<U, F>(&self, dispatcher: Dispatcher, f: F) -> Composable<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> anyhow::Result<Vec<U>> + Send + Sync + 'static,
    {
        self.derive(dispatcher, f)
    }

    /// Run `f` on every value for its side effect.
    ///
    /// The returned stream carries no values; it completes when every `f`
    /// has finished and fails on the first error.
    pub fn consume<F>(&self, f: F) -> Composable<()>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.consume_on(self.shared.dispatcher.clone(), f)
    }

    /// Like [`consume`](Self::consume), but run `f` on `dispatcher`.
    pub fn consume_on<F>(&self, dispatcher: Dispatcher, f: F) -> Composable<()>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.derive(dispatcher, move |value| f(value).map(|()| Vec::new()))
    }

    fn derive<U, F>(&self, dispatcher: Dispatcher, f: F) -> Composable<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> anyhow::Result<Vec<U>> + Send + Sync + 'static,
    {
        let downstream = Composable::new(dispatcher.clone());
        let target = downstream.clone();
        let f = Arc::new(f);
        let pending = Arc::new(Pending {
            scheduled: AtomicUsize::new(0),
            upstream_done: AtomicBool::new(false),
        });

        self.subscribe(move |signal| match signal {
            Signal::Next(value) => {
                pending.scheduled.fetch_add(1, Ordering::SeqCst);
                let f = f.clone();
                let unit_target = target.clone();
                let unit_pending = pending.clone();
                let scheduled = dispatcher.schedule(move || {
                    match catch_unwind(AssertUnwindSafe(|| f(value))) {
                        Ok(Ok(values)) => {
                            for mapped in values {
                                unit_target.accept(mapped);
                            }
                        }
                        Ok(Err(e)) => {
                            unit_target.fail(RelayError::callback(e));
                        }
                        Err(payload) => {
                            unit_target.fail(RelayError::panicked(&panic_message(&payload)));
                        }
                    }
                    let remaining = unit_pending.scheduled.fetch_sub(1, Ordering::SeqCst) - 1;
                    if remaining == 0 && unit_pending.upstream_done.load(Ordering::SeqCst) {
                        unit_target.complete();
                    }
                });
                if let Err(e) = scheduled {
                    pending.scheduled.fetch_sub(1, Ordering::SeqCst);
                    target.fail(e);
                }
            }
            Signal::Error(e) => {
                target.fail(e);
            }
            Signal::Complete => {
                pending.upstream_done.store(true, Ordering::SeqCst);
                if pending.scheduled.load(Ordering::SeqCst) == 0 {
                    target.complete();
                }
            }
        });

        downstream
    }

    /// Run `callback` for every value, on the delivering thread.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(move |signal| {
            if let Signal::Next(value) = &signal {
                callback(value);
            }
        });
        self
    }

    /// Run `callback` once if the stream fails.
    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&RelayError) + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        self.subscribe(move |signal| {
            if let Signal::Error(e) = &signal {
                let taken = callback.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(callback) = taken {
                    callback(e);
                }
            }
        });
        self
    }

    /// Run `callback` once if the stream completes successfully.
    pub fn on_complete<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        self.subscribe(move |signal| {
            if let Signal::Complete = signal {
                let taken = callback.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(callback) = taken {
                    callback();
                }
            }
        });
        self
    }

    fn wait_terminal(&self, timeout: Duration) -> Result<MutexGuard<'_, StreamState<T>>, RelayError> {
        let state = self.lock();
        let (state, _) = self
            .shared
            .settled
            .wait_timeout_while(state, timeout, |s| s.terminal.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match state.terminal.clone() {
            None => Err(RelayError::Timeout { duration: timeout }),
            Some(Terminal::Failed(e)) => Err(e),
            Some(Terminal::Completed) => Ok(state),
        }
    }

    /// Block until the stream ends and return its last value.
    ///
    /// # Errors
    ///
    /// - the stream's error if it failed
    /// - [`RelayError::Empty`] if it completed without values
    /// - [`RelayError::Timeout`] if it has not ended within `timeout`
    pub fn await_timeout(&self, timeout: Duration) -> Result<T, RelayError> {
        let state = self.wait_terminal(timeout)?;
        state.history.last().cloned().ok_or(RelayError::Empty)
    }

    /// Block until the stream ends and return every value it carried.
    pub fn collect_timeout(&self, timeout: Duration) -> Result<Vec<T>, RelayError> {
        let state = self.wait_terminal(timeout)?;
        Ok(state.history.clone())
    }

    /// Async form of [`await_timeout`](Self::await_timeout).
    pub async fn wait(&self, timeout: Duration) -> Result<T, RelayError> {
        self.collect(timeout)
            .await?
            .pop()
            .ok_or(RelayError::Empty)
    }

    /// Async form of [`collect_timeout`](Self::collect_timeout).
    pub async fn collect(&self, timeout: Duration) -> Result<Vec<T>, RelayError> {
        match tokio::time::timeout(timeout, self.ended()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RelayError::Timeout { duration: timeout }),
        }
    }

    async fn ended(&self) -> Result<Vec<T>, RelayError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let state = self.lock();
                match &state.terminal {
                    Some(Terminal::Completed) => return Ok(state.history.clone()),
                    Some(Terminal::Failed(e)) => return Err(e.clone()),
                    None => {}
                }
            }
            notified.await;
        }
    }

    /// Observe the stream as an async [`Stream`](futures::Stream).
    ///
    /// Yields every value (including already accepted ones), then an `Err`
    /// item if the stream failed, then ends.
    pub fn into_stream(&self) -> BoxStream<'static, Result<T, RelayError>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sender = Mutex::new(Some(sender));

        self.subscribe(move |signal| {
            let mut slot = sender.lock().unwrap_or_else(PoisonError::into_inner);
            let item = match signal {
                Signal::Next(value) => Ok(value),
                Signal::Error(e) => {
                    let item = Err(e);
                    if let Some(sender) = slot.take() {
                        let _ = sender.send(item);
                    }
                    return;
                }
                Signal::Complete => {
                    slot.take();
                    return;
                }
            };
            if let Some(sender) = slot.as_ref() {
                if sender.send(item).is_err() {
                    trace!("stream receiver dropped");
                }
            }
        });

        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed()
    }

    /// Returns true once the stream has completed or failed.
    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Values accepted so far.
    pub fn values(&self) -> Vec<T> {
        self.lock().history.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Composable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let terminal = match &state.terminal {
            None => "open".to_string(),
            Some(Terminal::Completed) => "completed".to_string(),
            Some(Terminal::Failed(e)) => format!("failed: {}", e),
        };
        f.debug_struct("Composable")
            .field("values", &state.history.len())
            .field("subscribers", &state.subscribers.len())
            .field("terminal", &terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_from_value_emits_then_completes() {
        let c = Composable::from_value(7, Dispatcher::immediate("test"));
        assert!(c.is_terminated());
        assert_eq!(c.await_timeout(WAIT).unwrap(), 7);
        assert_eq!(c.collect_timeout(WAIT).unwrap(), vec![7]);
    }

    #[test]
    fn test_map_transforms_each_value_in_order() {
        let source = Composable::from_iter(1..=5, Dispatcher::immediate("test"));
        let doubled = source.map(|v| Ok(v * 2));
        assert_eq!(doubled.collect_timeout(WAIT).unwrap(), vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_map_on_sequential_lane_waits_for_units() {
        let lane = Dispatcher::sequential("map-lane", 64).unwrap();
        let source = Composable::new(Dispatcher::immediate("source"));
        let mapped = source.map_on(lane.clone(), |v: u32| {
            thread::sleep(Duration::from_millis(2));
            Ok(v + 100)
        });

        for v in 0..10 {
            source.accept(v);
        }
        source.complete();

        assert_eq!(
            mapped.collect_timeout(WAIT).unwrap(),
            (100..110).collect::<Vec<_>>()
        );
        lane.shutdown();
    }

    #[test]
    fn test_map_error_fails_downstream() {
        let source = Composable::from_iter(vec![1, 2, 3], Dispatcher::immediate("test"));
        let mapped = source.map(|v| {
            if v == 2 {
                anyhow::bail!("two is not allowed")
            }
            Ok(v)
        });

        let err = mapped.await_timeout(WAIT).unwrap_err();
        assert!(matches!(err, RelayError::Callback { .. }));
        assert!(err.to_string().contains("two is not allowed"));
        // The value before the failure was delivered, the one after was dropped
        assert_eq!(mapped.values(), vec![1]);
    }

    #[test]
    fn test_map_panic_fails_downstream() {
        let source = Composable::from_value(1, Dispatcher::immediate("test"));
        let mapped = source.map(|_: i32| -> anyhow::Result<i32> { panic!("mapper bug") });
        assert!(mapped
            .await_timeout(WAIT)
            .unwrap_err()
            .to_string()
            .contains("mapper bug"));
    }

    #[test]
    fn test_upstream_error_propagates_through_chain() {
        let source: Composable<i32> = Composable::new(Dispatcher::immediate("test"));
        let end = source.map(|v| Ok(v + 1)).map(|v| Ok(v * 2));

        source.fail(RelayError::callback(anyhow::anyhow!("source broke")));

        assert!(end
            .await_timeout(WAIT)
            .unwrap_err()
            .to_string()
            .contains("source broke"));
    }

    #[test]
    fn test_late_subscriber_sees_history() {
        let c = Composable::from_iter(vec!["a", "b"], Dispatcher::immediate("test"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();

        c.on_success(move |v| seen_clone.lock().unwrap().push(*v))
            .on_complete(move || completed_clone.store(true, Ordering::SeqCst));

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_values_after_terminal_are_dropped() {
        let c = Composable::new(Dispatcher::immediate("test"));
        assert!(c.accept(1));
        assert!(c.complete());
        assert!(!c.accept(2));
        assert!(!c.complete());
        assert!(!c.fail(RelayError::Empty));
        assert_eq!(c.collect_timeout(WAIT).unwrap(), vec![1]);
    }

    #[test]
    fn test_consume_runs_side_effects_and_completes() {
        let total = Arc::new(AtomicUsize::new(0));
        let total_clone = total.clone();

        let done = Composable::from_iter(1..=4usize, Dispatcher::immediate("test")).consume(move |v| {
            total_clone.fetch_add(v, Ordering::SeqCst);
            Ok(())
        });

        assert!(done.collect_timeout(WAIT).unwrap().is_empty());
        assert!(matches!(done.await_timeout(WAIT), Err(RelayError::Empty)));
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_on_error_fires_once() {
        let c: Composable<u8> = Composable::new(Dispatcher::immediate("test"));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        c.on_error(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        c.fail(RelayError::Empty);
        c.fail(RelayError::Empty);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_await_times_out_without_losing_values() {
        let c = Composable::new(Dispatcher::immediate("test"));
        assert!(c.await_timeout(Duration::from_millis(1)).unwrap_err().is_timeout());

        let producer = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.accept("late");
            producer.complete();
        });

        assert_eq!(c.await_timeout(WAIT).unwrap(), "late");
        handle.join().unwrap();
    }

    #[test]
    fn test_subscriber_panic_reported_as_fault() {
        let dispatcher = Dispatcher::immediate("faults");
        let mut faults = dispatcher.faults();
        let c = Composable::new(dispatcher);
        c.on_success(|_: &u8| panic!("observer bug"));

        assert!(c.accept(1));
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.origin, "composable subscriber");
        assert!(fault.message.contains("observer bug"));
    }

    #[test]
    fn test_subscriber_attaches_to_its_own_stream() {
        let c = Composable::new(Dispatcher::immediate("nested"));
        let inner = c.clone();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let attached = AtomicBool::new(false);

        c.on_success(move |_: &u8| {
            if !attached.swap(true, Ordering::SeqCst) {
                let done_tx = done_tx.clone();
                inner.on_complete(move || {
                    let _ = done_tx.send(());
                });
            }
        });

        assert!(c.accept(1));
        assert!(c.accept(2));
        assert!(done_rx.try_recv().is_err());

        assert!(c.complete());
        done_rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_stage_derived_inside_subscriber_replays_history() {
        let c = Composable::new(Dispatcher::immediate("nested"));
        let inner = c.clone();
        let derived = Arc::new(Mutex::new(None));
        let derived_clone = derived.clone();

        c.on_success(move |_: &u32| {
            let mut slot = derived_clone.lock().unwrap();
            if slot.is_none() {
                *slot = Some(inner.map(|v| Ok(v * 10)));
            }
        });

        assert!(c.accept(1));
        assert!(c.accept(2));
        assert!(c.complete());

        let mapped = derived.lock().unwrap().take().unwrap();
        assert_eq!(mapped.collect_timeout(WAIT).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_subscriber_feeds_values_back() {
        let c = Composable::new(Dispatcher::immediate("feedback"));
        let inner = c.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        c.on_success(move |v: &u32| {
            seen_clone.lock().unwrap().push(*v);
            if *v < 3 {
                inner.accept(v + 1);
            }
        });

        assert!(c.accept(1));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(c.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_history_retained_after_completion() {
        let c = Composable::new(Dispatcher::immediate("history"));
        for v in 0..100u32 {
            assert!(c.accept(v));
        }
        assert!(c.complete());

        assert_eq!(c.values().len(), 100);
        let replayed = c.map(Ok).collect_timeout(WAIT).unwrap();
        assert_eq!(replayed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_schedule_failure_fails_downstream() {
        let lane = Dispatcher::sequential("closed-lane", 4).unwrap();
        lane.shutdown();

        let c = Composable::from_value(1, lane);
        assert!(matches!(
            c.await_timeout(WAIT),
            Err(RelayError::Shutdown { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_collect_and_stream() {
        let c = Composable::new(Dispatcher::immediate("test"));
        let producer = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.accept(1);
            producer.accept(2);
            producer.complete();
        });

        let mut stream = c.into_stream();
        assert_eq!(c.collect(WAIT).await.unwrap(), vec![1, 2]);
        assert_eq!(c.wait(WAIT).await.unwrap(), 2);

        let mut streamed = Vec::new();
        while let Some(item) = stream.next().await {
            streamed.push(item.unwrap());
        }
        assert_eq!(streamed, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stream_yields_error_item() {
        let c: Composable<u8> = Composable::new(Dispatcher::immediate("test"));
        c.accept(9);
        c.fail(RelayError::Empty);

        let items: Vec<_> = c.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), 9);
        assert!(matches!(items[1], Err(RelayError::Empty)));
    }
}
