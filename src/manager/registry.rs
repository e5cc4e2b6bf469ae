use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Name → shared instance map owned by the manager.
///
/// Lookups hand out `Arc` clones, so every caller asking for the same name
/// observes the same state object.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.lock().get(name).cloned()
    }

    /// Existing entry for `name`, or the one built by `create`.
    pub fn get_or_insert_with(&self, name: &str, create: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(name) {
            return Arc::clone(existing);
        }
        let created = Arc::new(create());
        entries.insert(name.to_string(), Arc::clone(&created));
        created
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        let mut out: Vec<_> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
