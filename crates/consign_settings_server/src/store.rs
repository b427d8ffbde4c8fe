//! In-memory document storage.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Holds the authoritative document of each resource.
#[derive(Debug, Default)]
pub struct SettingsStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl SettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the document stored for `resource`.
    pub fn get(&self, resource: &str) -> Option<Value> {
        self.documents.read().get(resource).cloned()
    }

    /// Stores `document`, returning the previous one.
    pub fn put(&self, resource: impl Into<String>, document: Value) -> Option<Value> {
        self.documents.write().insert(resource.into(), document)
    }

    /// Removes the document of `resource`.
    pub fn remove(&self, resource: &str) -> Option<Value> {
        self.documents.write().remove(resource)
    }

    /// Returns true if `resource` has a document.
    pub fn contains(&self, resource: &str) -> bool {
        self.documents.read().contains_key(resource)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Runs `update` on the document of `resource` under the write lock.
    ///
    /// `update` receives the current document, if any, and returns the
    /// one to store. Nothing is stored if it fails.
    pub fn update<E>(
        &self,
        resource: &str,
        update: impl FnOnce(Option<&Value>) -> Result<Value, E>,
    ) -> Result<Value, E> {
        let mut documents = self.documents.write();
        let next = update(documents.get(resource))?;
        documents.insert(resource.to_string(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_remove() {
        let store = SettingsStore::new();
        assert!(store.is_empty());

        assert_eq!(store.put("/a", json!({"x": 1})), None);
        assert_eq!(store.put("/a", json!({"x": 2})), Some(json!({"x": 1})));
        assert!(store.contains("/a"));
        assert_eq!(store.get("/a"), Some(json!({"x": 2})));
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove("/a"), Some(json!({"x": 2})));
        assert!(store.get("/a").is_none());
    }

    #[test]
    fn failed_update_stores_nothing() {
        let store = SettingsStore::new();
        store.put("/a", json!({"x": 1}));

        let result: Result<Value, &str> = store.update("/a", |_| Err("rejected"));
        assert_eq!(result, Err("rejected"));
        assert_eq!(store.get("/a"), Some(json!({"x": 1})));

        let next: Result<Value, &str> = store.update("/a", |current| {
            let mut doc = current.cloned().unwrap_or_default();
            doc["y"] = json!(2);
            Ok(doc)
        });
        assert_eq!(next, Ok(json!({"x": 1, "y": 2})));
    }
}
