//! Local indexed cache of resources.
//!
//! Written by the informer, read by business handlers. Objects are stored
//! behind `Arc` so readers get a cheap snapshot that stays valid after the
//! entry is replaced or removed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Computes the cache key of an object.
pub type KeyFn<V> = Arc<dyn Fn(&V) -> Result<String> + Send + Sync>;

/// Computes the values an object is indexed under for one named index.
pub type IndexFn<V> = Arc<dyn Fn(&V) -> Vec<String> + Send + Sync>;

struct Index<V> {
    func: IndexFn<V>,
    /// index value -> keys of the objects carrying it
    entries: HashMap<String, HashSet<String>>,
}

struct Inner<V> {
    items: HashMap<String, Arc<V>>,
    indices: HashMap<String, Index<V>>,
}

impl<V> Inner<V> {
    fn unindex(&mut self, key: &str, obj: &V) {
        for index in self.indices.values_mut() {
            for value in (index.func)(obj) {
                if let Some(keys) = index.entries.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.entries.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &str, obj: &V) {
        for index in self.indices.values_mut() {
            for value in (index.func)(obj) {
                index
                    .entries
                    .entry(value)
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }

    fn insert(&mut self, key: String, obj: Arc<V>) {
        if let Some(old) = self.items.remove(&key) {
            self.unindex(&key, &old);
        }
        self.index(&key, &obj);
        self.items.insert(key, obj);
    }

    fn remove(&mut self, key: &str) -> Option<Arc<V>> {
        let old = self.items.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }
}

/// Thread-safe object store keyed by a key function, with named secondary indices.
pub struct Indexer<V> {
    key_fn: KeyFn<V>,
    inner: RwLock<Inner<V>>,
}

impl<V> Indexer<V> {
    pub fn new(key_fn: impl Fn(&V) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            key_fn: Arc::new(key_fn),
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                indices: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache key of `obj`.
    pub fn key_of(&self, obj: &V) -> Result<String> {
        (self.key_fn)(obj)
    }

    /// Insert or replace `obj`. Returns its key.
    pub fn add(&self, obj: V) -> Result<String> {
        let key = self.key_of(&obj)?;
        self.write().insert(key.clone(), Arc::new(obj));
        Ok(key)
    }

    /// Remove the object stored under `key`, returning it if it was present.
    pub fn delete(&self, key: &str) -> Option<Arc<V>> {
        self.write().remove(key)
    }

    /// Current object stored under `key`. `None` means it is gone (or never was).
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().items.contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<V>> {
        self.read().items.values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole content with `objs`, rebuilding every index.
    ///
    /// Fails without touching the cache if any object has no key.
    pub fn replace(&self, objs: Vec<V>) -> Result<()> {
        let keyed = objs
            .into_iter()
            .map(|obj| Ok((self.key_of(&obj)?, Arc::new(obj))))
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.write();
        inner.items.clear();
        for index in inner.indices.values_mut() {
            index.entries.clear();
        }
        for (key, obj) in keyed {
            inner.insert(key, obj);
        }
        Ok(())
    }

    /// Register a named index. Objects already in the cache are indexed immediately.
    pub fn add_index(
        &self,
        name: impl Into<String>,
        func: impl Fn(&V) -> Vec<String> + Send + Sync + 'static,
    ) {
        let func: IndexFn<V> = Arc::new(func);
        let mut inner = self.write();

        let mut entries: HashMap<String, HashSet<String>> = HashMap::new();
        for (key, obj) in &inner.items {
            for value in func(obj.as_ref()) {
                entries.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.into(), Index { func, entries });
    }

    /// Objects whose `index` function yields `value`.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<V>>> {
        let inner = self.read();
        let idx = inner
            .indices
            .get(index)
            .ok_or_else(|| Error::IndexNotFound(index.to_string()))?;
        Ok(idx
            .entries
            .get(value)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.items.get(key).cloned())
            .collect())
    }

    /// Keys of the objects whose `index` function yields `value`.
    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<String>> {
        let inner = self.read();
        let idx = inner
            .indices
            .get(index)
            .ok_or_else(|| Error::IndexNotFound(index.to_string()))?;
        Ok(idx
            .entries
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }
}
