//! Per-request context — typed attributes attached by middleware.
//!
//! A [`Request`](crate::Request) carries an [`Attributes`] map as its only
//! extension point. Attaching a value never mutates a map another stage can
//! see: [`Attributes::with`] returns a new map sharing every untouched entry.
//!
//! Well-known attributes:
//!
//! - [`Session`] — attached by an upstream session stage, read through
//!   [`Request::session`](crate::Request::session).
//! - [`Deadline`] — attached by the [`Kernel`](crate::kernel::Kernel) when a
//!   request timeout is configured.
//! - [`WorkerContext`] — attached by the backend; exposes the worker's
//!   singleton [`Registry`].

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::Value;
use tokio::time::Instant;

use crate::registry::Registry;

/// Type-erased, copy-on-write attribute map keyed by type.
#[derive(Clone, Default)]
pub struct Attributes {
    map: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Attributes {
    /// Create a new empty attribute map
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this map with `value` stored under its type,
    /// replacing any previous value of the same type.
    #[must_use]
    pub fn with<T>(&self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        let mut map = HashMap::clone(&self.map);
        map.insert(TypeId::of::<T>(), Arc::new(value));
        Self { map: Arc::new(map) }
    }

    /// Returns a copy of this map without the value of type `T`.
    #[must_use]
    pub fn without<T>(&self) -> Self
    where
        T: Send + Sync + 'static,
    {
        if !self.contains::<T>() {
            return self.clone();
        }
        let mut map = HashMap::clone(&self.map);
        map.remove(&TypeId::of::<T>());
        Self { map: Arc::new(map) }
    }

    /// Get a value from the attribute map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Server-side state for one client, identified by a session id.
///
/// Values are JSON so that a session store can persist them without knowing
/// handler types. Interior locking lets handlers update a session reached
/// through a shared request.
#[derive(Debug)]
pub struct Session {
    id: String,
    data: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_data(id, HashMap::new())
    }

    /// Restores a session with previously stored data.
    pub fn with_data(id: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            data: RwLock::new(data),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Snapshot of every stored value.
    pub fn all(&self) -> HashMap<String, Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The instant by which the current request must have produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(pub Instant);

impl Deadline {
    pub fn instant(self) -> Instant {
        self.0
    }

    pub fn is_expired(self) -> bool {
        Instant::now() >= self.0
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(self) -> std::time::Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

/// Identity and singletons of the worker serving the request.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    id: usize,
    registry: Arc<Registry>,
}

impl WorkerContext {
    pub fn new(id: usize, registry: Arc<Registry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
