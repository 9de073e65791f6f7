//! Composable wrapper over a synchronous CRUD repository.
//!
//! [`ComposableRepository`] mirrors every [`CrudRepository`] method 1:1, but
//! runs the delegate call as a unit on a [`Dispatcher`] and hands back a
//! [`Composable`] instead of blocking.
//!
//! Besides the fixed CRUD surface, a repository can carry named finders
//! (`find_by_name`, `find_by_city`, ...). All method names are resolved
//! through one dispatch table built at construction time:
//!
//! ```text
//! invoke("find_one", json!(7))          ──► Route::Crud(CrudMethod::FindOne)
//! invoke("find_by_name", json!("Ada"))  ──► Route::Finder(..)
//! invoke("find_by_shoe_size", ..)       ──► RelayError::NoMatchingSelector
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::composable::Composable;
use crate::dispatch::Dispatcher;
use crate::error::RelayError;
use crate::selector::{Selector, SelectorRegistry};

/// Synchronous CRUD access to entities of type `T` identified by `ID`.
pub trait CrudRepository<T, ID>: Send + Sync + 'static {
    /// Insert or replace `entity`; returns it as stored.
    fn save(&self, entity: T) -> Result<T>;

    fn find_one(&self, id: &ID) -> Result<Option<T>>;

    fn exists(&self, id: &ID) -> Result<bool>;

    fn find_all(&self) -> Result<Vec<T>>;

    /// Entities for the ids that exist, in `ids` order.
    fn find_all_by_id(&self, ids: &[ID]) -> Result<Vec<T>>;

    fn count(&self) -> Result<u64>;

    fn delete(&self, id: &ID) -> Result<()>;

    fn delete_entity(&self, entity: &T) -> Result<()>;

    fn delete_all(&self) -> Result<()>;
}

/// CRUD methods reachable through [`ComposableRepository::invoke`].
///
/// Only the methods that yield entities are routable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudMethod {
    FindOne,
    FindAll,
    FindAllById,
}

impl CrudMethod {
    pub const ALL: [CrudMethod; 3] = [
        CrudMethod::FindOne,
        CrudMethod::FindAll,
        CrudMethod::FindAllById,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CrudMethod::FindOne => "find_one",
            CrudMethod::FindAll => "find_all",
            CrudMethod::FindAllById => "find_all_by_id",
        }
    }
}

/// A named query taking JSON arguments.
pub type Finder<T> = Arc<dyn Fn(&Value) -> Result<Vec<T>> + Send + Sync>;

/// Where a method name is dispatched.
pub enum Route<T> {
    Crud(CrudMethod),
    Finder(Finder<T>),
}

impl<T> Clone for Route<T> {
    fn clone(&self) -> Self {
        match self {
            Route::Crud(method) => Route::Crud(*method),
            Route::Finder(finder) => Route::Finder(finder.clone()),
        }
    }
}

impl<T> fmt::Debug for Route<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Crud(method) => write!(f, "Crud({})", method.name()),
            Route::Finder(_) => f.write_str("Finder"),
        }
    }
}

/// Builds a [`ComposableRepository`] with its finders.
pub struct RepositoryBuilder<T, ID, R> {
    delegate: Arc<R>,
    dispatcher: Dispatcher,
    finders: Vec<(String, Finder<T>)>,
    _id: PhantomData<fn() -> ID>,
}

impl<T, ID, R> RepositoryBuilder<T, ID, R>
where
    T: Clone + Send + 'static,
    ID: Clone + Send + Sync + 'static,
    R: CrudRepository<T, ID>,
{
    /// Register a finder under `name`. A finder named like a CRUD method
    /// is never reached; the CRUD route wins.
    pub fn with_finder<F>(mut self, name: impl Into<String>, finder: F) -> Self
    where
        F: Fn(&R, &Value) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        let delegate = self.delegate.clone();
        let route: Finder<T> = Arc::new(move |args: &Value| finder(delegate.as_ref(), args));
        self.finders.push((name.into(), route));
        self
    }

    pub fn build(self) -> ComposableRepository<T, ID, R> {
        let routes = SelectorRegistry::new();
        for method in CrudMethod::ALL {
            routes.register(Selector::exact(method.name()), Route::Crud(method));
        }
        let mut finders = Vec::with_capacity(self.finders.len());
        for (name, finder) in self.finders {
            routes.register(Selector::exact(name.clone()), Route::Finder(finder));
            finders.push(name);
        }
        debug!(routes = routes.len(), "repository dispatch table built");

        ComposableRepository {
            delegate: self.delegate,
            dispatcher: self.dispatcher,
            routes: Arc::new(routes),
            finders: Arc::new(finders),
            _id: PhantomData,
        }
    }
}

/// Dispatcher-backed mirror of a [`CrudRepository`].
pub struct ComposableRepository<T, ID, R> {
    delegate: Arc<R>,
    dispatcher: Dispatcher,
    routes: Arc<SelectorRegistry<Route<T>>>,
    finders: Arc<Vec<String>>,
    _id: PhantomData<fn() -> ID>,
}

impl<T, ID, R> Clone for ComposableRepository<T, ID, R> {
    fn clone(&self) -> Self {
        Self {
            delegate: self.delegate.clone(),
            dispatcher: self.dispatcher.clone(),
            routes: self.routes.clone(),
            finders: self.finders.clone(),
            _id: PhantomData,
        }
    }
}

impl<T, ID, R> ComposableRepository<T, ID, R>
where
    T: Clone + Send + 'static,
    ID: Clone + Send + Sync + 'static,
    R: CrudRepository<T, ID>,
{
    /// Wrap `delegate` with no extra finders.
    pub fn new(delegate: Arc<R>, dispatcher: Dispatcher) -> Self {
        Self::builder(delegate, dispatcher).build()
    }

    pub fn builder(delegate: Arc<R>, dispatcher: Dispatcher) -> RepositoryBuilder<T, ID, R> {
        RepositoryBuilder {
            delegate,
            dispatcher,
            finders: Vec::new(),
            _id: PhantomData,
        }
    }

    /// Save every entity from `entities`; yields each as stored.
    pub fn save(&self, entities: &Composable<T>) -> Composable<T> {
        let delegate = self.delegate.clone();
        entities.map_on(self.dispatcher.clone(), move |entity| delegate.save(entity))
    }

    pub fn find_one(&self, id: ID) -> Composable<Option<T>> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || Ok(vec![delegate.find_one(&id)?]))
    }

    pub fn exists(&self, id: ID) -> Composable<bool> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || Ok(vec![delegate.exists(&id)?]))
    }

    /// Yields every entity, one value each.
    pub fn find_all(&self) -> Composable<T> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || delegate.find_all())
    }

    /// Yields the entities for the ids `ids` carries, as they arrive.
    pub fn find_all_by_id(&self, ids: &Composable<ID>) -> Composable<T> {
        let delegate = self.delegate.clone();
        ids.flat_map_on(self.dispatcher.clone(), move |id| {
            delegate.find_all_by_id(std::slice::from_ref(&id))
        })
    }

    pub fn count(&self) -> Composable<u64> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || Ok(vec![delegate.count()?]))
    }

    pub fn delete(&self, id: ID) -> Composable<()> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || {
            delegate.delete(&id)?;
            Ok(vec![()])
        })
    }

    /// Delete every entity from `entities`.
    pub fn delete_entities(&self, entities: &Composable<T>) -> Composable<()> {
        let delegate = self.delegate.clone();
        entities.consume_on(self.dispatcher.clone(), move |entity| {
            delegate.delete_entity(&entity)
        })
    }

    pub fn delete_all(&self) -> Composable<()> {
        let delegate = self.delegate.clone();
        Composable::from_work(self.dispatcher.clone(), move || {
            delegate.delete_all()?;
            Ok(vec![()])
        })
    }

    /// Look up where `method` is dispatched.
    pub fn route(&self, method: &str) -> Result<Route<T>, RelayError> {
        self.routes
            .select_one(method)
            .map(|matched| matched.payload().clone())
    }

    /// Names of every routable method, CRUD first.
    pub fn methods(&self) -> Vec<String> {
        CrudMethod::ALL
            .iter()
            .map(|method| method.name().to_string())
            .chain(self.finders.iter().cloned())
            .collect()
    }

    /// Dispatch `method` by name with JSON `args`.
    ///
    /// `find_one` takes an id, `find_all_by_id` an array of ids, `find_all`
    /// ignores its arguments; finders receive `args` as given. Argument
    /// errors fail the returned stream.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoMatchingSelector`] if no route is registered for
    /// `method`.
    pub fn invoke(&self, method: &str, args: Value) -> Result<Composable<T>, RelayError>
    where
        ID: DeserializeOwned,
    {
        let route = self.route(method)?;
        let delegate = self.delegate.clone();
        let method = method.to_string();
        debug!(method = %method, route = ?route, "invoking repository method");

        Ok(Composable::from_work(self.dispatcher.clone(), move || match route {
            Route::Crud(CrudMethod::FindOne) => {
                let id: ID = serde_json::from_value(args)
                    .with_context(|| format!("{} expects an id argument", method))?;
                Ok(delegate.find_one(&id)?.into_iter().collect())
            }
            Route::Crud(CrudMethod::FindAll) => delegate.find_all(),
            Route::Crud(CrudMethod::FindAllById) => {
                let ids: Vec<ID> = serde_json::from_value(args)
                    .with_context(|| format!("{} expects an array of ids", method))?;
                delegate.find_all_by_id(&ids)
            }
            Route::Finder(finder) => finder(&args),
        }))
    }

    pub fn delegate(&self) -> &Arc<R> {
        &self.delegate
    }
}

impl<T, ID, R> fmt::Debug for ComposableRepository<T, ID, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposableRepository")
            .field("dispatcher", &self.dispatcher)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRepository, Person};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    type People = ComposableRepository<Person, u64, MemoryRepository>;

    fn repository(dispatcher: Dispatcher) -> People {
        ComposableRepository::builder(Arc::new(MemoryRepository::new()), dispatcher)
            .with_finder("find_by_name", |repo: &MemoryRepository, args: &Value| {
                let name = args.as_str().context("find_by_name expects a string")?;
                repo.find_by_name(name)
            })
            .build()
    }

    fn seed(repo: &People) -> Vec<Person> {
        let people = Composable::from_iter(
            vec![
                Person::new(1, "Ada"),
                Person::new(2, "Grace"),
                Person::new(3, "Ada"),
            ],
            Dispatcher::immediate("seed"),
        );
        repo.save(&people).collect_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_save_then_find() {
        let repo = repository(Dispatcher::immediate("repo"));
        let saved = seed(&repo);
        assert_eq!(saved.len(), 3);

        let found = repo.find_one(2).await_timeout(WAIT).unwrap();
        assert_eq!(found, Some(Person::new(2, "Grace")));
        assert_eq!(repo.find_one(99).await_timeout(WAIT).unwrap(), None);
        assert!(repo.exists(1).await_timeout(WAIT).unwrap());
        assert_eq!(repo.count().await_timeout(WAIT).unwrap(), 3);
    }

    #[test]
    fn test_find_all_streams_each_entity() {
        let repo = repository(Dispatcher::immediate("repo"));
        seed(&repo);

        let names: Vec<String> = repo
            .find_all()
            .collect_timeout(WAIT)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Ada", "Grace", "Ada"]);
    }

    #[test]
    fn test_find_all_by_id_skips_missing() {
        let repo = repository(Dispatcher::immediate("repo"));
        seed(&repo);

        let ids = Composable::from_iter(vec![3, 42, 1], Dispatcher::immediate("ids"));
        let found: Vec<u64> = repo
            .find_all_by_id(&ids)
            .collect_timeout(WAIT)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(found, vec![3, 1]);
    }

    #[test]
    fn test_deletes() {
        let repo = repository(Dispatcher::immediate("repo"));
        let saved = seed(&repo);

        repo.delete(1).await_timeout(WAIT).unwrap();
        assert_eq!(repo.count().await_timeout(WAIT).unwrap(), 2);

        let doomed = Composable::from_iter(vec![saved[1].clone()], Dispatcher::immediate("doomed"));
        repo.delete_entities(&doomed).collect_timeout(WAIT).unwrap();
        assert_eq!(repo.count().await_timeout(WAIT).unwrap(), 1);

        repo.delete_all().await_timeout(WAIT).unwrap();
        assert_eq!(repo.count().await_timeout(WAIT).unwrap(), 0);
    }

    #[test]
    fn test_save_failure_fails_stream() {
        let repo = repository(Dispatcher::immediate("repo"));
        repo.delegate().refuse_name("Mallory");

        let people = Composable::from_iter(
            vec![Person::new(1, "Alice"), Person::new(2, "Mallory")],
            Dispatcher::immediate("people"),
        );
        let err = repo.save(&people).collect_timeout(WAIT).unwrap_err();
        assert!(err.to_string().contains("Mallory"));
        assert!(!repo.exists(2).await_timeout(WAIT).unwrap());
    }

    #[test]
    fn test_invoke_routes_crud_and_finders() {
        let repo = repository(Dispatcher::immediate("repo"));
        seed(&repo);

        let one = repo.invoke("find_one", json!(2)).unwrap();
        assert_eq!(one.await_timeout(WAIT).unwrap().name, "Grace");

        let adas = repo.invoke("find_by_name", json!("Ada")).unwrap();
        assert_eq!(adas.collect_timeout(WAIT).unwrap().len(), 2);

        let some = repo.invoke("find_all_by_id", json!([1, 3])).unwrap();
        assert_eq!(some.collect_timeout(WAIT).unwrap().len(), 2);

        let all = repo.invoke("find_all", Value::Null).unwrap();
        assert_eq!(all.collect_timeout(WAIT).unwrap().len(), 3);
    }

    #[test]
    fn test_invoke_unknown_method() {
        let repo = repository(Dispatcher::immediate("repo"));
        match repo.invoke("find_by_shoe_size", json!(44)) {
            Err(RelayError::NoMatchingSelector { key }) => assert_eq!(key, "find_by_shoe_size"),
            other => panic!("Expected NoMatchingSelector, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invoke_bad_arguments_fail_stream() {
        let repo = repository(Dispatcher::immediate("repo"));
        let err = repo
            .invoke("find_one", json!("not-an-id"))
            .unwrap()
            .await_timeout(WAIT)
            .unwrap_err();
        assert!(err.to_string().contains("find_one expects an id argument"));
    }

    #[test]
    fn test_methods_lists_routes() {
        let repo = repository(Dispatcher::immediate("repo"));
        assert_eq!(
            repo.methods(),
            vec!["find_one", "find_all", "find_all_by_id", "find_by_name"]
        );
        assert!(matches!(repo.route("find_all"), Ok(Route::Crud(CrudMethod::FindAll))));
        assert!(matches!(repo.route("find_by_name"), Ok(Route::Finder(_))));
    }

    #[test]
    fn test_sequential_lane_keeps_save_order() {
        let lane = Dispatcher::sequential("repo-lane", 64).unwrap();
        let repo = repository(lane.clone());

        let source = Composable::new(Dispatcher::immediate("source"));
        let saved = repo.save(&source);
        for id in 1..=20 {
            source.accept(Person::new(id, format!("p{}", id)));
        }
        source.complete();

        let ids: Vec<u64> = saved
            .collect_timeout(WAIT)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
        lane.shutdown();
    }
}
