//! Dispatcher for running units of work off the caller's thread.
//!
//! The `Dispatcher` is responsible for:
//! 1. Accepting units of work without ever blocking the caller
//! 2. Running them under the configured [`Strategy`]
//! 3. Containing panics so that no unit can take down an execution thread
//!
//! # Strategies
//!
//! | Strategy     | Runs on                        | Ordering                    |
//! |--------------|--------------------------------|-----------------------------|
//! | `Immediate`  | the caller's thread            | call order                  |
//! | `Pooled`     | the tokio blocking pool        | none                        |
//! | `Sequential` | one dedicated worker thread    | FIFO, one unit at a time    |
//!
//! The sequential lane is what the facade uses to serialize every blocking
//! store call onto a single logical execution lane. Its queue is bounded:
//! a full queue is reported as [`RelayError::QueueFull`] instead of blocking
//! the producer.
//!
//! # Example
//!
//! ```ignore
//! let lane = Dispatcher::sequential("relay-io", 1024)?;
//!
//! let promise = lane.submit(|| client.ping());
//! lane.schedule(|| tracing::info!("runs after ping"))?;
//!
//! lane.shutdown(); // drains the queue, joins the worker
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, DispatchFault, RelayError};
use crate::promise::Promise;

/// Capacity of the fault broadcast channel.
const FAULT_CAPACITY: usize = 256;

/// A unit of work.
pub type Unit = Box<dyn FnOnce() + Send + 'static>;

/// Execution strategy of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Run on the caller's thread.
    Immediate,
    /// Run on an unordered worker pool.
    Pooled,
    /// Run one at a time, in submission order, on a single worker.
    Sequential,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Immediate => write!(f, "immediate"),
            Strategy::Pooled => write!(f, "pooled"),
            Strategy::Sequential => write!(f, "sequential"),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" | "inline" => Ok(Strategy::Immediate),
            "pooled" | "pool" => Ok(Strategy::Pooled),
            "sequential" | "ordered" => Ok(Strategy::Sequential),
            other => Err(anyhow!(
                "unknown dispatch strategy '{}': expected immediate, pooled or sequential",
                other
            )),
        }
    }
}

struct SequentialLane {
    capacity: usize,
    /// `None` once shut down; dropping the sender lets the worker drain
    /// and exit.
    sender: RwLock<Option<mpsc::Sender<Unit>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

enum Lane {
    Immediate,
    Pooled(Handle),
    Sequential(SequentialLane),
}

struct Inner {
    name: String,
    lane: Lane,
    closed: AtomicBool,
    faults: broadcast::Sender<DispatchFault>,
}

/// Schedules units of work under a pluggable strategy.
///
/// Cloning a `Dispatcher` yields another handle to the same lane.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher that runs every unit on the caller's thread.
    pub fn immediate(name: impl Into<String>) -> Self {
        Self::from_lane(name.into(), Lane::Immediate, broadcast::channel(FAULT_CAPACITY).0)
    }

    /// Create a pooled dispatcher on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn pooled(name: impl Into<String>) -> Result<Self> {
        let handle = Handle::try_current()
            .context("pooled dispatcher must be created inside a tokio runtime")?;
        Ok(Self::pooled_on(name, handle))
    }

    /// Create a pooled dispatcher that hands units to `handle`'s blocking pool.
    pub fn pooled_on(name: impl Into<String>, handle: Handle) -> Self {
        Self::from_lane(
            name.into(),
            Lane::Pooled(handle),
            broadcast::channel(FAULT_CAPACITY).0,
        )
    }

    /// Create a sequential dispatcher with its own worker thread and a
    /// bounded queue of `capacity` units.
    ///
    /// # Errors
    ///
    /// Fails if `capacity` is zero or the worker thread cannot be spawned.
    pub fn sequential(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(anyhow!("dispatcher '{}' needs a queue capacity above zero", name));
        }

        let (faults, _) = broadcast::channel(FAULT_CAPACITY);
        let (sender, mut receiver) = mpsc::channel::<Unit>(capacity);

        let worker_name = name.clone();
        let worker_faults = faults.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(dispatcher = %worker_name, "sequential lane started");
                while let Some(unit) = receiver.blocking_recv() {
                    run_guarded(&worker_name, &worker_faults, unit);
                }
                debug!(dispatcher = %worker_name, "sequential lane drained");
            })
            .with_context(|| format!("failed to spawn worker for dispatcher '{}'", name))?;

        let lane = SequentialLane {
            capacity,
            sender: RwLock::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        };
        Ok(Self::from_lane(name, Lane::Sequential(lane), faults))
    }

    /// Create a dispatcher for `strategy`.
    ///
    /// `capacity` only applies to the sequential strategy.
    pub fn with_strategy(
        name: impl Into<String>,
        strategy: Strategy,
        capacity: usize,
    ) -> Result<Self> {
        match strategy {
            Strategy::Immediate => Ok(Self::immediate(name)),
            Strategy::Pooled => Self::pooled(name),
            Strategy::Sequential => Self::sequential(name, capacity),
        }
    }

    fn from_lane(name: String, lane: Lane, faults: broadcast::Sender<DispatchFault>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                lane,
                closed: AtomicBool::new(false),
                faults,
            }),
        }
    }

    /// Enqueue a unit of work. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`RelayError::QueueFull`] when the sequential queue is at capacity
    /// - [`RelayError::Shutdown`] after [`shutdown`](Self::shutdown)
    pub fn schedule<F>(&self, unit: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(self.shutdown_error());
        }

        match &self.inner.lane {
            Lane::Immediate => {
                run_guarded(&self.inner.name, &self.inner.faults, Box::new(unit));
                Ok(())
            }
            Lane::Pooled(handle) => {
                let name = self.inner.name.clone();
                let faults = self.inner.faults.clone();
                // Detached: outcomes travel through promises, not join handles
                drop(handle.spawn_blocking(move || run_guarded(&name, &faults, Box::new(unit))));
                Ok(())
            }
            Lane::Sequential(lane) => {
                let sender = lane
                    .sender
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(sender) = sender.as_ref() else {
                    return Err(self.shutdown_error());
                };
                sender.try_send(Box::new(unit)).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(
                            dispatcher = %self.inner.name,
                            capacity = lane.capacity,
                            "sequential queue full, rejecting unit"
                        );
                        RelayError::QueueFull {
                            dispatcher: self.inner.name.clone(),
                            capacity: lane.capacity,
                        }
                    }
                    mpsc::error::TrySendError::Closed(_) => self.shutdown_error(),
                })
            }
        }
    }

    /// Schedule `work` and deliver its outcome to the returned promise.
    ///
    /// An `Err` from `work`, a panic inside it, or a failure to schedule it
    /// all fail the promise; nothing is thrown at the caller.
    pub fn submit<T, F>(&self, work: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let promise = self.promise();
        let target = promise.clone();
        let scheduled = self.schedule(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RelayError::callback(e)),
                Err(payload) => Err(RelayError::panicked(&panic_message(&payload))),
            };
            target.deliver(outcome);
        });
        if let Err(e) = scheduled {
            promise.deliver(Err(e));
        }
        promise
    }

    /// Create a pending promise whose callback faults are reported here.
    pub fn promise<T: Clone + Send + 'static>(&self) -> Promise<T> {
        Promise::with_dispatcher(self.clone())
    }

    /// Subscribe to faults raised by units and callbacks on this dispatcher.
    ///
    /// Only faults raised after subscription are received.
    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.inner.faults.subscribe()
    }

    /// Publish a fault on this dispatcher's fault channel.
    pub(crate) fn report_fault(&self, origin: &'static str, message: String) {
        error!(dispatcher = %self.inner.name, origin, panic = %message, "callback panicked");
        let _ = self.inner.faults.send(DispatchFault {
            dispatcher: self.inner.name.clone(),
            origin,
            message,
            at: Utc::now(),
        });
    }

    /// Stop accepting work.
    ///
    /// The sequential lane drains the units already queued and its worker is
    /// joined, unless `shutdown` is called from that worker itself.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Lane::Sequential(lane) = &self.inner.lane {
            lane.sender
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            if thread::current().id() != lane.worker_id {
                let worker = lane
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(worker) = worker {
                    if worker.join().is_err() {
                        warn!(dispatcher = %self.inner.name, "worker exited with a panic");
                    }
                }
            }
        }

        info!(dispatcher = %self.inner.name, strategy = %self.strategy(), "dispatcher shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The dispatcher's name (also the worker thread name for sequential lanes).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn strategy(&self) -> Strategy {
        match &self.inner.lane {
            Lane::Immediate => Strategy::Immediate,
            Lane::Pooled(_) => Strategy::Pooled,
            Lane::Sequential(_) => Strategy::Sequential,
        }
    }

    /// Queue capacity for sequential lanes, `None` otherwise.
    pub fn queue_capacity(&self) -> Option<usize> {
        match &self.inner.lane {
            Lane::Sequential(lane) => Some(lane.capacity),
            _ => None,
        }
    }

    fn shutdown_error(&self) -> RelayError {
        RelayError::Shutdown {
            dispatcher: self.inner.name.clone(),
        }
    }
}

/// Run a unit, turning a panic into a fault.
fn run_guarded(name: &str, faults: &broadcast::Sender<DispatchFault>, unit: Unit) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(unit)) {
        let message = panic_message(&payload);
        error!(dispatcher = %name, panic = %message, "unit of work panicked");
        let _ = faults.send(DispatchFault {
            dispatcher: name.to_string(),
            origin: "unit",
            message,
            at: Utc::now(),
        });
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("strategy", &self.strategy())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_immediate_runs_inline() {
        let dispatcher = Dispatcher::immediate("inline");
        let hit = Arc::new(AtomicUsize::new(0));
        let hit_clone = hit.clone();

        dispatcher
            .schedule(move || {
                hit_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.strategy(), Strategy::Immediate);
        assert_eq!(dispatcher.queue_capacity(), None);
    }

    #[test]
    fn test_sequential_preserves_submission_order() {
        let dispatcher = Dispatcher::sequential("ordered", 256).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            dispatcher
                .schedule(move || seen.lock().unwrap().push(i))
                .unwrap();
        }
        dispatcher.shutdown();

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequential_never_overlaps() {
        let dispatcher = Dispatcher::sequential("exclusive", 1024).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                let ran = ran.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let active = active.clone();
                        let max_active = max_active.clone();
                        let ran = ran.clone();
                        dispatcher
                            .schedule(move || {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                max_active.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_micros(50));
                                active.fetch_sub(1, Ordering::SeqCst);
                                ran.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        dispatcher.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 200);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let dispatcher = Dispatcher::sequential("survivor", 16).unwrap();
        let mut faults = dispatcher.faults();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit_clone = hit.clone();

        dispatcher.schedule(|| panic!("unit exploded")).unwrap();
        dispatcher
            .schedule(move || {
                hit_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        dispatcher.shutdown();

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.origin, "unit");
        assert_eq!(fault.dispatcher, "survivor");
        assert!(fault.message.contains("unit exploded"));
    }

    #[test]
    fn test_full_queue_is_rejected() {
        let dispatcher = Dispatcher::sequential("tiny", 1).unwrap();
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        dispatcher
            .schedule(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker is busy; one slot left in the queue
        dispatcher.schedule(|| {}).unwrap();
        let err = dispatcher.schedule(|| {}).unwrap_err();
        assert!(matches!(err, RelayError::QueueFull { capacity: 1, .. }));

        release_tx.send(()).unwrap();
        dispatcher.shutdown();
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let dispatcher = Dispatcher::sequential("closed", 4).unwrap();
        dispatcher.shutdown();
        dispatcher.shutdown();

        assert!(dispatcher.is_shutdown());
        assert!(matches!(
            dispatcher.schedule(|| {}),
            Err(RelayError::Shutdown { .. })
        ));

        let promise = dispatcher.submit(|| Ok(1));
        assert!(matches!(
            promise.await_timeout(Duration::from_millis(10)),
            Err(RelayError::Shutdown { .. })
        ));
    }

    #[test]
    fn test_shutdown_from_worker_does_not_deadlock() {
        let dispatcher = Dispatcher::sequential("self-stop", 4).unwrap();
        let inner = dispatcher.clone();
        let done = dispatcher.submit(move || {
            inner.shutdown();
            Ok(())
        });
        done.await_timeout(Duration::from_secs(5)).unwrap();
        assert!(dispatcher.is_shutdown());
    }

    #[test]
    fn test_submit_delivers_value_error_and_panic() {
        let dispatcher = Dispatcher::sequential("submit", 16).unwrap();
        let timeout = Duration::from_secs(5);

        let ok = dispatcher.submit(|| Ok("value"));
        let failed = dispatcher.submit(|| -> anyhow::Result<&str> { anyhow::bail!("bad input") });
        let panicked = dispatcher.submit(|| -> anyhow::Result<&str> { panic!("kaboom") });

        assert_eq!(ok.await_timeout(timeout).unwrap(), "value");
        assert!(failed
            .await_timeout(timeout)
            .unwrap_err()
            .to_string()
            .contains("bad input"));
        assert!(panicked
            .await_timeout(timeout)
            .unwrap_err()
            .to_string()
            .contains("kaboom"));

        dispatcher.shutdown();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Dispatcher::sequential("zero", 0).is_err());
    }

    #[test]
    fn test_pooled_requires_runtime() {
        assert!(Dispatcher::pooled("no-runtime").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pooled_runs_off_caller_thread() {
        let dispatcher = Dispatcher::pooled("pool").unwrap();
        let caller = thread::current().id();

        let promise = dispatcher.submit(move || Ok(thread::current().id() != caller));
        assert!(promise.wait(Duration::from_secs(5)).await.unwrap());
        assert_eq!(dispatcher.strategy(), Strategy::Pooled);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("sequential".parse::<Strategy>().unwrap(), Strategy::Sequential);
        assert_eq!(" Pooled ".parse::<Strategy>().unwrap(), Strategy::Pooled);
        assert_eq!("inline".parse::<Strategy>().unwrap(), Strategy::Immediate);
        assert!("ring".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Sequential.to_string(), "sequential");
    }

    #[test]
    fn test_debug_impl() {
        let dispatcher = Dispatcher::immediate("debuggable");
        let debug = format!("{:?}", dispatcher);
        assert!(debug.contains("Dispatcher"));
        assert!(debug.contains("debuggable"));
    }
}
