//! In-memory collaborators for testing code built on relay.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! relay = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use relay::testing::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let relay = CommandFacade::new(store.clone())?;
//!
//! store.inject_siblings("users", "ada", vec![b"v1".to_vec(), b"v2".to_vec()]);
//! store.fail_next(1); // next operation fails once
//!
//! relay.store("users", "ada", "v3".to_string()).await_timeout(timeout)?;
//! assert_eq!(store.acquisitions(), 1);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{
    operation, BoxOperation, DeleteRequest, FetchRequest, RawObject, Resource, Retrier,
    StoreClient, StoreRequest,
};
use crate::repository::CrudRepository;

type Objects = HashMap<String, Vec<RawObject>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by a store and every bucket it hands out.
#[derive(Default)]
struct StoreState {
    /// container -> key -> siblings
    containers: Mutex<HashMap<String, Objects>>,
    refused: Mutex<HashSet<String>>,
    acquisitions: AtomicUsize,
    executions: AtomicUsize,
    /// Operations still to fail before the store behaves again.
    failures: AtomicUsize,
    acquire_delay: Mutex<Duration>,
}

impl StoreState {
    fn with_objects<R>(&self, container: &str, f: impl FnOnce(&mut Objects) -> R) -> R {
        let mut containers = lock(&self.containers);
        f(containers.entry(container.to_string()).or_default())
    }

    fn attempt(&self, kind: &str) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("injected {} failure", kind);
        }
        Ok(())
    }
}

fn with_retries<T>(retrier: Option<Retrier>, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    match retrier {
        Some(retrier) => retrier.run(|_| attempt()),
        None => attempt(),
    }
}

/// An in-memory [`StoreClient`] with failure and conflict injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every acquisition.
    pub fn with_acquire_delay(self, delay: Duration) -> Self {
        *lock(&self.state.acquire_delay) = delay;
        self
    }

    /// Make acquisition of `container` fail.
    pub fn refuse(&self, container: &str) {
        lock(&self.state.refused).insert(container.to_string());
    }

    /// Fail the next `count` operation executions (store, fetch or delete).
    pub fn fail_next(&self, count: usize) {
        self.state.failures.store(count, Ordering::SeqCst);
    }

    /// Replace the object at `container/key` with conflicting siblings.
    pub fn inject_siblings(&self, container: &str, key: &str, values: Vec<Vec<u8>>) {
        let siblings = values
            .into_iter()
            .map(|value| RawObject::new("text/plain; charset=utf-8", value).with_key(key))
            .collect();
        self.state.with_objects(container, |objects| {
            objects.insert(key.to_string(), siblings);
        });
    }

    /// The single stored object at `container/key`, if there is exactly one.
    pub fn raw(&self, container: &str, key: &str) -> Option<RawObject> {
        self.state.with_objects(container, |objects| match objects.get(key) {
            Some(siblings) if siblings.len() == 1 => siblings.first().cloned(),
            _ => None,
        })
    }

    /// Number of successful and failed acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of operation executions so far, retries included.
    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::SeqCst)
    }
}

impl StoreClient for MemoryStore {
    type Resource = MemoryBucket;

    fn acquire(&self, name: &str) -> Result<MemoryBucket> {
        self.state.acquisitions.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.acquire_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if lock(&self.state.refused).contains(name) {
            bail!("bucket '{}' is not available", name);
        }
        Ok(MemoryBucket {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }
}

/// A container handed out by [`MemoryStore`].
pub struct MemoryBucket {
    name: String,
    state: Arc<StoreState>,
}

impl Resource for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn store_operation(&self, request: StoreRequest) -> BoxOperation<RawObject> {
        let state = self.state.clone();
        let container = self.name.clone();
        operation(move || {
            with_retries(request.retrier, || {
                state.attempt("store")?;
                let key = request
                    .key
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                state.with_objects(&container, |objects| -> Result<RawObject> {
                    let siblings = objects.get(&key).cloned().unwrap_or_default();
                    let current = match (&request.resolver, siblings.len()) {
                        (_, 0) => None,
                        (_, 1) => siblings.first().cloned(),
                        (Some(resolver), _) => Some(resolver(siblings.as_slice())?),
                        (None, _) => bail!("unresolved siblings at {}/{}", container, key),
                    };
                    let next = match &request.mutation {
                        Some(mutation) => mutation(current.as_ref())?,
                        None => request.object.clone(),
                    };
                    let stored = next.with_key(key.clone());
                    objects.insert(key.clone(), vec![stored.clone()]);
                    Ok(stored)
                })
            })
        })
    }

    fn fetch_operation(&self, request: FetchRequest) -> BoxOperation<Option<RawObject>> {
        let state = self.state.clone();
        let container = self.name.clone();
        operation(move || {
            with_retries(request.retrier, || {
                state.attempt("fetch")?;
                let siblings = state.with_objects(&container, |objects| {
                    objects.get(&request.key).cloned().unwrap_or_default()
                });
                match (&request.resolver, siblings.len()) {
                    (_, 0) => Ok(None),
                    (_, 1) => Ok(siblings.into_iter().next()),
                    (Some(resolver), _) => resolver(siblings.as_slice()).map(Some),
                    (None, n) => Err(anyhow!(
                        "{} unresolved siblings at {}/{}",
                        n,
                        container,
                        request.key
                    )),
                }
            })
        })
    }

    fn delete_operation(&self, request: DeleteRequest) -> BoxOperation<()> {
        let state = self.state.clone();
        let container = self.name.clone();
        operation(move || {
            with_retries(request.retrier, || {
                state.attempt("delete")?;
                state.with_objects(&container, |objects| {
                    objects.remove(&request.key);
                });
                Ok(())
            })
        })
    }
}

/// Entity used by repository tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,
    pub name: String,
}

impl Person {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A [`CrudRepository`] of [`Person`] backed by a `BTreeMap`.
///
/// Saving a person with id 0 assigns the next free id.
#[derive(Default)]
pub struct MemoryRepository {
    people: Mutex<BTreeMap<u64, Person>>,
    next_id: AtomicU64,
    fail_saves: Mutex<HashSet<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make saving anyone called `name` fail.
    pub fn refuse_name(&self, name: &str) {
        lock(&self.fail_saves).insert(name.to_string());
    }

    /// Finder: everyone whose name equals `name`.
    pub fn find_by_name(&self, name: &str) -> Result<Vec<Person>> {
        Ok(lock(&self.people)
            .values()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }
}

impl CrudRepository<Person, u64> for MemoryRepository {
    fn save(&self, mut entity: Person) -> Result<Person> {
        if lock(&self.fail_saves).contains(&entity.name) {
            bail!("refusing to save '{}'", entity.name);
        }
        let mut people = lock(&self.people);
        if entity.id == 0 {
            let floor = people.keys().next_back().copied().unwrap_or(0);
            let next = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            entity.id = next.max(floor + 1);
        }
        people.insert(entity.id, entity.clone());
        Ok(entity)
    }

    fn find_one(&self, id: &u64) -> Result<Option<Person>> {
        Ok(lock(&self.people).get(id).cloned())
    }

    fn exists(&self, id: &u64) -> Result<bool> {
        Ok(lock(&self.people).contains_key(id))
    }

    fn find_all(&self) -> Result<Vec<Person>> {
        Ok(lock(&self.people).values().cloned().collect())
    }

    fn find_all_by_id(&self, ids: &[u64]) -> Result<Vec<Person>> {
        let people = lock(&self.people);
        Ok(ids.iter().filter_map(|id| people.get(id).cloned()).collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(lock(&self.people).len() as u64)
    }

    fn delete(&self, id: &u64) -> Result<()> {
        lock(&self.people).remove(id);
        Ok(())
    }

    fn delete_entity(&self, entity: &Person) -> Result<()> {
        self.delete(&entity.id)
    }

    fn delete_all(&self) -> Result<()> {
        lock(&self.people).clear();
        Ok(())
    }
}
