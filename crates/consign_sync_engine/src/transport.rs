//! Transport abstraction for the settings API.

use crate::buffer::ChangeSet;
use crate::document::{from_json, SettingsDocument};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Outcome of fetching the full document.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResponse<T> {
    /// The server holds a document.
    Found(T),
    /// The server has no document yet; callers fall back to defaults.
    NotFound,
}

impl<T> LoadResponse<T> {
    /// Returns the document, if any.
    pub fn into_document(self) -> Option<T> {
        match self {
            LoadResponse::Found(document) => Some(document),
            LoadResponse::NotFound => None,
        }
    }
}

/// A save handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// The changed paths, snapshotted when the save was dispatched.
    pub changes: ChangeSet,
    /// The optimistic document at dispatch, for transports that replace
    /// the whole document instead of patching it.
    pub document: Value,
}

/// A settings transport talks to the settings API for one domain.
///
/// Implementations own timeout and retry policy; the engine calls each
/// method at most once per save cycle.
#[async_trait]
pub trait SettingsTransport<T: Send>: Send + Sync {
    /// Fetches the full document. `NotFound` is a normal outcome.
    async fn load(&self) -> SyncResult<LoadResponse<T>>;

    /// Sends the changes and returns the full authoritative document.
    async fn save_partial(&self, request: &SaveRequest) -> SyncResult<T>;

    /// Fetches the full document after a failed save.
    async fn reload(&self) -> SyncResult<LoadResponse<T>> {
        self.load().await
    }
}

#[async_trait]
impl<T, Tr> SettingsTransport<T> for Arc<Tr>
where
    T: Send + 'static,
    Tr: SettingsTransport<T> + ?Sized,
{
    async fn load(&self) -> SyncResult<LoadResponse<T>> {
        (**self).load().await
    }

    async fn save_partial(&self, request: &SaveRequest) -> SyncResult<T> {
        (**self).save_partial(request).await
    }

    async fn reload(&self) -> SyncResult<LoadResponse<T>> {
        (**self).reload().await
    }
}

type Normalizer = Box<dyn Fn(&mut Value) + Send + Sync>;

/// An in-memory transport for testing.
///
/// Holds the authoritative document, applies saves to it the way a
/// server would, and can be scripted to fail or to hold saves in flight.
pub struct MockTransport<T> {
    server: Mutex<Option<Value>>,
    normalizer: Option<Normalizer>,
    load_failures: Mutex<VecDeque<SyncError>>,
    reload_failures: Mutex<VecDeque<SyncError>>,
    save_failures: Mutex<VecDeque<SyncError>>,
    saves: Mutex<Vec<SaveRequest>>,
    loads: AtomicUsize,
    reloads: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    save_started: Notify,
    _document: PhantomData<fn() -> T>,
}

impl<T> MockTransport<T> {
    /// Creates a transport whose server has no document (404).
    pub fn new() -> Self {
        Self {
            server: Mutex::new(None),
            normalizer: None,
            load_failures: Mutex::new(VecDeque::new()),
            reload_failures: Mutex::new(VecDeque::new()),
            save_failures: Mutex::new(VecDeque::new()),
            saves: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            gate: Mutex::new(None),
            save_started: Notify::new(),
            _document: PhantomData,
        }
    }

    /// Creates a transport whose server already holds `document`.
    pub fn with_document(document: Value) -> Self {
        let transport = Self::new();
        transport.set_document(document);
        transport
    }

    /// Runs `normalize` on the server document after every save, like
    /// server-side defaulting or derived fields.
    pub fn with_normalizer(mut self, normalize: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        self.normalizer = Some(Box::new(normalize));
        self
    }

    /// Replaces the server document.
    pub fn set_document(&self, document: Value) {
        *self.server.lock() = Some(document);
    }

    /// Removes the server document.
    pub fn remove_document(&self) {
        *self.server.lock() = None;
    }

    /// Returns the server document.
    pub fn document(&self) -> Option<Value> {
        self.server.lock().clone()
    }

    /// Makes the next `load` fail with `error`.
    pub fn fail_next_load(&self, error: SyncError) {
        self.load_failures.lock().push_back(error);
    }

    /// Makes the next `reload` fail with `error`.
    pub fn fail_next_reload(&self, error: SyncError) {
        self.reload_failures.lock().push_back(error);
    }

    /// Makes the next `save_partial` fail with `error`.
    pub fn fail_next_save(&self, error: SyncError) {
        self.save_failures.lock().push_back(error);
    }

    /// Holds every following save in flight until released.
    pub fn hold_saves(&self) -> SaveGate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&semaphore));
        SaveGate { semaphore }
    }

    /// Stops holding saves and lets any held save complete.
    pub fn resume_saves(&self) {
        if let Some(semaphore) = self.gate.lock().take() {
            semaphore.close();
        }
    }

    /// Every save request received, in order.
    pub fn saves(&self) -> Vec<SaveRequest> {
        self.saves.lock().clone()
    }

    /// Number of saves received.
    pub fn save_count(&self) -> usize {
        self.saves.lock().len()
    }

    /// Number of `load` calls.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `reload` calls.
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` saves have been received.
    pub async fn wait_for_saves(&self, count: usize) {
        loop {
            let notified = self.save_started.notified();
            if self.save_count() >= count {
                return;
            }
            notified.await;
        }
    }

    fn fetch(&self) -> SyncResult<LoadResponse<T>>
    where
        T: SettingsDocument,
    {
        match self.server.lock().clone() {
            Some(document) => Ok(LoadResponse::Found(from_json(document)?)),
            None => Ok(LoadResponse::NotFound),
        }
    }
}

impl<T> Default for MockTransport<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: SettingsDocument> SettingsTransport<T> for MockTransport<T> {
    async fn load(&self) -> SyncResult<LoadResponse<T>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.load_failures.lock().pop_front() {
            return Err(error);
        }
        self.fetch()
    }

    async fn save_partial(&self, request: &SaveRequest) -> SyncResult<T> {
        self.saves.lock().push(request.clone());
        self.save_started.notify_waiters();

        let gate = self.gate.lock().clone();
        if let Some(semaphore) = gate {
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }

        if let Some(error) = self.save_failures.lock().pop_front() {
            return Err(error);
        }

        let mut server = self.server.lock();
        let base = server
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let mut next = request.changes.apply_to(&base)?;
        if let Some(normalize) = &self.normalizer {
            normalize(&mut next);
        }
        *server = Some(next.clone());
        drop(server);

        from_json(next)
    }

    async fn reload(&self) -> SyncResult<LoadResponse<T>> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.reload_failures.lock().pop_front() {
            return Err(error);
        }
        self.fetch()
    }
}

/// Releases saves held by [`MockTransport::hold_saves`].
#[derive(Debug, Clone)]
pub struct SaveGate {
    semaphore: Arc<Semaphore>,
}

impl SaveGate {
    /// Lets one held (or future) save through.
    pub fn release_one(&self) {
        self.semaphore.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FieldPath;
    use serde_json::json;

    fn request(path: &str, value: Value) -> SaveRequest {
        SaveRequest {
            changes: ChangeSet::from_entries([(FieldPath::parse(path).unwrap(), value)]),
            document: json!({}),
        }
    }

    #[tokio::test]
    async fn load_reports_missing_document() {
        let transport = MockTransport::<Value>::new();
        assert_eq!(transport.load().await.unwrap(), LoadResponse::NotFound);
        assert_eq!(transport.load_count(), 1);
    }

    #[tokio::test]
    async fn save_applies_changes_and_normalizes() {
        let transport = MockTransport::<Value>::with_document(json!({"name": "Shop"}))
            .with_normalizer(|doc| {
                doc["revision"] = json!(1);
            });

        let saved = transport
            .save_partial(&request("tax.rate", json!(5)))
            .await
            .unwrap();

        assert_eq!(saved, json!({"name": "Shop", "tax": {"rate": 5}, "revision": 1}));
        assert_eq!(transport.document(), Some(saved));
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let transport = MockTransport::<Value>::with_document(json!({}));
        transport.fail_next_save(SyncError::transport_retryable("reset"));
        transport.fail_next_reload(SyncError::Timeout);

        assert!(transport.save_partial(&request("a", json!(1))).await.is_err());
        assert!(transport.save_partial(&request("a", json!(2))).await.is_ok());
        assert_eq!(transport.reload().await, Err(SyncError::Timeout));
        assert!(transport.reload().await.is_ok());
        assert_eq!(transport.reload_count(), 2);
    }

    #[tokio::test]
    async fn held_saves_wait_for_release() {
        let transport = Arc::new(MockTransport::<Value>::with_document(json!({})));
        let gate = transport.hold_saves();

        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.save_partial(&request("a", json!(1))).await })
        };

        transport.wait_for_saves(1).await;
        assert_eq!(transport.document(), Some(json!({})));

        gate.release_one();
        let saved = pending.await.unwrap().unwrap();
        assert_eq!(saved, json!({"a": 1}));
    }

    #[tokio::test]
    async fn arc_transports_delegate() {
        let transport = Arc::new(MockTransport::<Value>::with_document(json!({"x": 1})));
        let shared: Arc<MockTransport<Value>> = Arc::clone(&transport);
        let loaded = SettingsTransport::<Value>::load(&shared).await.unwrap();
        assert_eq!(loaded.into_document(), Some(json!({"x": 1})));
        assert_eq!(transport.load_count(), 1);
    }
}
