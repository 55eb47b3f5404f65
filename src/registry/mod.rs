//! Per-worker singleton registry.
//!
//! Every worker builds one [`Registry`] before it serves its first request.
//! Registration happens only through [`RegistryBuilder`]; once built, the
//! registry is read-only and shared with request handlers through
//! [`WorkerContext`](crate::context::WorkerContext).

mod snowflake;

pub use snowflake::{EPOCH_MS, IdError, IdGenerator, MAX_WORKER_ID};

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no singleton registered for {0}")]
    Missing(&'static str),
}

struct Entry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Read-only map of singletons keyed by type.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<TypeId, Entry>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the singleton of type `T`, if one was registered.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.get(&TypeId::of::<T>())?;
        Arc::clone(&entry.value).downcast::<T>().ok()
    }

    /// Like [`get`](Self::get), but a missing singleton is an error.
    pub fn resolve<T>(&self) -> Result<Arc<T>, RegistryError>
    where
        T: Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(RegistryError::Missing(type_name::<T>()))
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.entries.values().map(|entry| entry.name))
            .finish()
    }
}

/// Collects singletons during worker startup.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<TypeId, Entry>,
}

impl RegistryBuilder {
    /// Registers `value` as the singleton of its type, replacing any earlier one.
    pub fn singleton<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.shared(Arc::new(value))
    }

    /// Registers an already shared value.
    pub fn shared<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        let name = type_name::<T>();
        if self
            .entries
            .insert(TypeId::of::<T>(), Entry { name, value })
            .is_some()
        {
            tracing::debug!(singleton = name, "replaced registered singleton");
        }
        self
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.entries.values().map(|entry| entry.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Database(&'static str);

    #[test]
    fn singletons_resolve_by_type() {
        let mut builder = Registry::builder();
        builder.singleton(Database("primary")).singleton(42u32);
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert_eq!(*registry.resolve::<Database>().unwrap(), Database("primary"));
        assert_eq!(registry.get::<u32>().as_deref(), Some(&42));

        let first = registry.get::<Database>().unwrap();
        let second = registry.get::<Database>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_singleton_is_an_error() {
        let registry = Registry::builder().build();
        let err = registry.resolve::<Database>().unwrap_err();
        assert!(err.to_string().contains("Database"));
        assert!(registry.get::<u32>().is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut builder = Registry::builder();
        builder.singleton(Database("a"));
        builder.singleton(Database("b"));
        assert!(builder.contains::<Database>());
        let registry = builder.build();
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.resolve::<Database>().unwrap(), Database("b"));
    }
}
