//! Lock-protected, type-erased key-value store.
//!
//! A [`Store`] carries per-request data (the request, the response sink, the
//! owning router) and arbitrary user values without a fixed schema. The well-known
//! slots are enumerated in [`Key`]; everything else lives under [`Key::User`].
//!
//! Reads take a shared lock and writes an exclusive one, so concurrent readers
//! never block each other and a writer never waits on more than one bounded
//! critical section. Only operations on the same store are linearized; there is
//! no ordering between keys.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Type-erased value held by a [`Store`].
pub type Value = Arc<dyn Any + Send + Sync>;

/// A key into a [`Store`].
///
/// # Examples
///
/// ```
/// use switchyard::store::Key;
///
/// assert_eq!(Key::from("session"), Key::User("session".to_owned()));
/// assert_eq!(Key::Request.to_string(), "request");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// The in-flight [`Request`](crate::Request).
    Request,
    /// The response sink for the in-flight request.
    Response,
    /// The [`Router`](crate::Router) that dispatched the request.
    App,
    /// Any application-defined value.
    User(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
            Self::App => f.write_str("app"),
            Self::User(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::User(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self::User(name)
    }
}

/// Concurrency-safe associative store from [`Key`] to type-erased values.
///
/// # Examples
///
/// ```
/// use switchyard::store::Store;
///
/// let store = Store::new();
/// store.set("visits", 1u32);
/// assert_eq!(store.get::<u32>("visits").as_deref(), Some(&1));
///
/// assert!(store.update("visits", 2u32));
/// assert!(!store.update("missing", 0u32));
///
/// store.delete("visits");
/// assert!(store.get::<u32>("visits").is_none());
/// ```
#[derive(Default)]
pub struct Store {
    data: RwLock<HashMap<Key, Value>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the value under `key`.
    pub fn set<T>(&self, key: impl Into<Key>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_value(key, Arc::new(value));
    }

    /// Inserts or overwrites an already shared value.
    pub fn set_value(&self, key: impl Into<Key>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    /// Returns the value under `key` if it is present and of type `T`.
    pub fn get<T>(&self, key: impl Into<Key>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_value(key).and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns the raw value under `key`.
    pub fn get_value(&self, key: impl Into<Key>) -> Option<Value> {
        self.data.read().get(&key.into()).cloned()
    }

    /// Overwrites the value under `key` only if the key is already present.
    ///
    /// Returns `false` and leaves the store untouched when the key is absent.
    pub fn update<T>(&self, key: impl Into<Key>, value: T) -> bool
    where
        T: Send + Sync + 'static,
    {
        let mut data = self.data.write();
        match data.get_mut(&key.into()) {
            Some(slot) => {
                *slot = Arc::new(value);
                true
            }
            None => false,
        }
    }

    /// Removes the value under `key`. Removing an absent key is a no-op.
    pub fn delete(&self, key: impl Into<Key>) {
        self.data.write().remove(&key.into());
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn contains(&self, key: impl Into<Key>) -> bool {
        self.data.read().contains_key(&key.into())
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_set().entries(data.keys()).finish()
    }
}
