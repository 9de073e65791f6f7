//! Selectors and the registry that matches keys against them.
//!
//! A [`SelectorRegistry`] maps [`Selector`]s to payloads. It serves two roles
//! in relay:
//!
//! - **Resource cache**: exact-name selectors keyed by container name, payload
//!   is the acquired resource handle
//! - **Subscriber table**: template selectors such as `/{container}/{key}`,
//!   payload is the subscriber callback (see [`TopicBus`](crate::TopicBus))
//!
//! # Matching
//!
//! `select(key)` yields every registration whose selector matches `key`, in
//! registration order. Matching is side-effect free and evaluated lazily
//! over a snapshot, so a `select` in progress is unaffected by a concurrent
//! `register` or `deregister`.
//!
//! Template matching splits pattern and key on `/`. Segment counts must be
//! equal, literal segments must be equal, and a `{name}` segment matches any
//! non-empty segment, binding `name` to it:
//!
//! ```ignore
//! let selector = Selector::template("/{container}/{key}");
//! let bindings = selector.matches("/orders/42").unwrap();
//! assert_eq!(bindings.get("container"), Some("orders"));
//! assert_eq!(bindings.get("key"), Some("42"));
//! assert!(selector.matches("/orders/42/extra").is_none());
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::RelayError;

/// Segment separator for template selectors.
pub const SEPARATOR: char = '/';

// =============================================================================
// Bindings
// =============================================================================

/// Variables captured by a template match, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(SmallVec<[(String, String); 4]>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value bound to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn bind(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }
}

// =============================================================================
// Template
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed path-like pattern with `{variable}` segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pattern: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let segments = pattern
            .split(SEPARATOR)
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) if !name.is_empty() => Segment::Variable(name.to_string()),
                    _ => Segment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self { pattern, segments }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of the variable segments, in order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn matches(&self, key: &str) -> Option<Bindings> {
        let mut bindings = Bindings::new();
        let mut parts = key.split(SEPARATOR);

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Variable(_) if part.is_empty() => return None,
                Segment::Variable(name) => bindings.bind(name, part),
            }
        }

        // Longer keys do not match
        if parts.next().is_some() {
            return None;
        }
        Some(bindings)
    }
}

// =============================================================================
// Selector
// =============================================================================

type PredicateFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A predicate over keys, optionally capturing variables.
#[derive(Clone)]
pub enum Selector {
    /// Matches iff the key equals the stored name.
    Exact(String),
    /// Matches path-like keys against a `{variable}` pattern.
    Template(Template),
    /// Matches when the caller-supplied predicate returns true.
    Predicate {
        description: String,
        predicate: PredicateFn,
    },
}

impl Selector {
    pub fn exact(name: impl Into<String>) -> Self {
        Selector::Exact(name.into())
    }

    pub fn template(pattern: impl Into<String>) -> Self {
        Selector::Template(Template::parse(pattern))
    }

    pub fn predicate<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Selector::Predicate {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Test `key`, returning the captured variables on a match.
    ///
    /// Exact and predicate selectors capture nothing.
    pub fn matches(&self, key: &str) -> Option<Bindings> {
        match self {
            Selector::Exact(name) => (name == key).then(Bindings::new),
            Selector::Template(template) => template.matches(key),
            Selector::Predicate { predicate, .. } => predicate(key).then(Bindings::new),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Exact(name) => write!(f, "exact({})", name),
            Selector::Template(template) => write!(f, "template({})", template.pattern()),
            Selector::Predicate { description, .. } => write!(f, "predicate({})", description),
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Identity of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(selector, payload)` pair held by a [`SelectorRegistry`].
pub struct Registration<P> {
    id: RegistrationId,
    selector: Selector,
    payload: P,
}

impl<P> Registration<P> {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }
}

impl<P> fmt::Debug for Registration<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

/// A registration that matched a key, with the variables it captured.
pub struct Match<P> {
    registration: Arc<Registration<P>>,
    bindings: Bindings,
}

impl<P> Match<P> {
    pub fn registration(&self) -> &Arc<Registration<P>> {
        &self.registration
    }

    pub fn payload(&self) -> &P {
        &self.registration.payload
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }
}

/// Lazy iterator over the registrations matching one key.
pub struct Select<P> {
    snapshot: std::vec::IntoIter<Arc<Registration<P>>>,
    key: String,
}

impl<P> Iterator for Select<P> {
    type Item = Match<P>;

    fn next(&mut self) -> Option<Match<P>> {
        for registration in self.snapshot.by_ref() {
            if let Some(bindings) = registration.selector.matches(&self.key) {
                return Some(Match {
                    registration,
                    bindings,
                });
            }
        }
        None
    }
}

/// Insertion-ordered mapping from selectors to payloads.
///
/// Safe to share across threads: `register`/`deregister` take a write lock,
/// `select` copies the registration list under a read lock and matches
/// outside it.
pub struct SelectorRegistry<P> {
    entries: RwLock<Vec<Arc<Registration<P>>>>,
}

impl<P> SelectorRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add a registration. Returns it so the caller can deregister later.
    pub fn register(&self, selector: Selector, payload: P) -> Arc<Registration<P>> {
        let registration = Arc::new(Registration {
            id: RegistrationId::new(),
            selector,
            payload,
        });
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration.clone());
        registration
    }

    /// All registrations matching `key`, in registration order.
    ///
    /// Re-evaluated on every call; nothing is memoized.
    pub fn select(&self, key: &str) -> Select<P> {
        let snapshot = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Select {
            snapshot: snapshot.into_iter(),
            key: key.to_string(),
        }
    }

    /// The first registration matching `key`.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoMatchingSelector`] when nothing matches.
    pub fn select_one(&self, key: &str) -> Result<Match<P>, RelayError> {
        self.select(key)
            .next()
            .ok_or_else(|| RelayError::NoMatchingSelector {
                key: key.to_string(),
            })
    }

    /// Remove the registration with `id`. Returns false if it was absent.
    pub fn deregister(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter().position(|r| r.id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove every registration for which `predicate` returns true.
    ///
    /// Returns the number removed.
    pub fn deregister_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Registration<P>) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|r| !predicate(r));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for SelectorRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for SelectorRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorRegistry")
            .field("registrations", &self.len())
            .finish()
    }
}
