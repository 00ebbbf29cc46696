use std::{collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::Mutex;

use crate::{RefError, Runtime, Value, WeakRef};

/// A map whose values can be garbage collected.
///
/// Values are held through [`WeakRef`]s only, so an entry never keeps its
/// value alive. Every entry chains a cleanup finalizer onto its value; once
/// the value is destroyed, the cleanup removes the entry during the next
/// finalizer-processing pass, which [`WeakValueMap::get`] and
/// [`WeakValueMap::set`] drain opportunistically. Callers who rarely touch
/// the map can drain it themselves through [`WeakValueMap::update`].
pub struct WeakValueMap<K> {
    runtime: Runtime,
    entries: Arc<Mutex<HashMap<K, WeakRef>>>,
}

impl<K> WeakValueMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look up a value. Absent and destroyed are indistinguishable: both
    /// read as `None`.
    pub fn get(&self, key: &K) -> Option<Value> {
        self.runtime.process();
        let reference = self.entries.lock().get(key).cloned()?;
        reference.object()
    }

    /// Store a value, replacing any previous entry for the key. Returns the
    /// stored value.
    ///
    /// Fails with [`RefError::InvalidValue`] for a value that can not be
    /// weakly referenced.
    pub fn set(&self, key: K, value: Value) -> Result<Value, RefError> {
        self.runtime.process();
        let reference = WeakRef::new(&self.runtime, value)
            .map_err(|_| RefError::InvalidValue(value.type_name()))?;

        // the cleanup captures the key and the exact reference instance
        // being stored, never the value itself: holding the value would
        // keep it alive, and a pending cleanup for a replaced entry must
        // not evict the replacement
        let cleanup = {
            let entries = Arc::clone(&self.entries);
            let key = key.clone();
            let reference = reference.clone();
            move || {
                let mut entries = entries.lock();
                if let Some(current) = entries.get(&key) {
                    if WeakRef::ptr_eq(current, &reference) {
                        entries.remove(&key);
                    }
                }
            }
        };
        reference
            .define_finalizer(cleanup)
            .map_err(|_| RefError::InvalidValue(value.type_name()))?;

        self.entries.lock().insert(key, reference);
        Ok(value)
    }

    /// Drain pending cleanups without reading or writing. Unnecessary as
    /// long as `get` or `set` run on occasion.
    pub fn update(&self) {
        self.runtime.process();
    }

    /// Number of physical entries, stale ones included until pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
