//! Registry of live stores and facets
//!
//! Stores and facets are created on first use and looked up by a record
//! kind (e.g. `"transactions"`) plus a [`ScopeKey`]. The registry owns the
//! [`ContextManager`] every store it hands out streams through, so clearing
//! it cancels all in-flight fetches at once.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use explorer_types::errors::{CacheError, CacheResult};
use explorer_types::ids::ScopeKey;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::context::ContextManager;

type Entries = HashMap<(String, ScopeKey), Arc<dyn Any + Send + Sync>>;

#[derive(Default)]
pub struct Registry {
    contexts: Arc<ContextManager>,
    entries: Mutex<Entries>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream registry shared by every store created through this registry.
    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// Look up `(kind, scope)`, creating it with `make` on first use.
    ///
    /// `make` runs without the registry lock held. If two callers race, the
    /// first insert wins and both get the same value.
    pub fn get_or_insert_with<V, F>(
        &self,
        kind: &str,
        scope: &ScopeKey,
        make: F,
    ) -> CacheResult<Arc<V>>
    where
        V: Any + Send + Sync,
        F: FnOnce(&Arc<ContextManager>) -> Arc<V>,
    {
        if let Some(existing) = self.get::<V>(kind, scope)? {
            return Ok(existing);
        }

        let created = make(&self.contexts);
        let mut entries = self.entries.lock();
        match entries.entry((kind.to_string(), scope.clone())) {
            Entry::Occupied(slot) => downcast(kind, scope, Arc::clone(slot.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&created) as Arc<dyn Any + Send + Sync>);
                debug!(kind, scope = %scope, "Registered cache entry");
                Ok(created)
            }
        }
    }

    pub fn get<V>(&self, kind: &str, scope: &ScopeKey) -> CacheResult<Option<Arc<V>>>
    where
        V: Any + Send + Sync,
    {
        let entry = self
            .entries
            .lock()
            .get(&(kind.to_string(), scope.clone()))
            .cloned();
        entry.map(|value| downcast(kind, scope, value)).transpose()
    }

    /// Drop one entry. Its streams are not cancelled; reset the store first
    /// if that matters.
    pub fn remove(&self, kind: &str, scope: &ScopeKey) -> bool {
        self.entries
            .lock()
            .remove(&(kind.to_string(), scope.clone()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cancel every stream and drop every entry. Returns entries dropped.
    pub fn clear(&self) -> usize {
        let cancelled = self.contexts.cancel_all();
        let dropped = {
            let mut entries = self.entries.lock();
            let n = entries.len();
            entries.clear();
            n
        };
        info!(dropped, cancelled, "Registry cleared");
        dropped
    }
}

fn downcast<V>(
    kind: &str,
    scope: &ScopeKey,
    value: Arc<dyn Any + Send + Sync>,
) -> CacheResult<Arc<V>>
where
    V: Any + Send + Sync,
{
    value.downcast::<V>().map_err(|_| CacheError::RegistryTypeMismatch {
        key: format!("{}/{}", kind, scope),
    })
}
