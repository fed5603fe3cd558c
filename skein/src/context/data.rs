//! Per-context keyed storage.
//!
//! Each execution context (and each atom's resolve context) owns one
//! [`DataMap`]: string keys to erased values, isolated from every other
//! context. Ancestor maps are only reachable read-only through
//! [`ExecutionContext::seek`](crate::ExecutionContext::seek).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::AnyValue;

#[derive(Clone, Default)]
pub(crate) struct DataMap {
    inner: Arc<Mutex<HashMap<Arc<str>, AnyValue>>>,
}

impl DataMap {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = (Arc<str>, AnyValue)>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries.into_iter().collect())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<Arc<str>, AnyValue>) -> R) -> R {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut map)
    }

    pub(crate) fn get<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        self.with(|map| map.get(key).cloned())
            .and_then(|value| value.downcast::<V>().ok())
    }

    pub(crate) fn set<V: Send + Sync + 'static>(&self, key: &str, value: V) {
        self.with(|map| {
            map.insert(Arc::from(key), Arc::new(value) as AnyValue);
        });
    }

    pub(crate) fn has(&self, key: &str) -> bool {
        self.with(|map| map.contains_key(key))
    }

    pub(crate) fn delete(&self, key: &str) -> bool {
        self.with(|map| map.remove(key).is_some())
    }

    pub(crate) fn get_or_set<V: Send + Sync + 'static>(
        &self,
        key: &str,
        make: impl FnOnce() -> V,
    ) -> Arc<V> {
        self.with(|map| {
            if let Some(existing) = map.get(key) {
                if let Ok(existing) = existing.clone().downcast::<V>() {
                    return existing;
                }
            }
            let fresh = Arc::new(make());
            map.insert(Arc::from(key), fresh.clone() as AnyValue);
            fresh
        })
    }

    pub(crate) fn clear(&self) {
        self.with(|map| map.clear());
    }
}
