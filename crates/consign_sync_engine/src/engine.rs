//! The settings sync engine.

use crate::buffer::{ChangeSet, PendingChangeBuffer};
use crate::config::EngineConfig;
use crate::document::{from_json, to_json, SettingsDocument};
use crate::error::{SyncError, SyncResult};
use crate::path::{get_path, set_in_place, FieldPath};
use crate::scheduler::{SaveScheduler, SchedulerPhase};
use crate::transport::{LoadResponse, SaveRequest, SettingsTransport};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Result of [`SyncEngine::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    /// The server document was published.
    Loaded,
    /// The server has no document; the default (if configured) was published.
    NotFound,
    /// The request failed; the document is unchanged.
    Failed(SyncError),
    /// The cache was cleared while the request was in flight.
    Superseded,
}

/// Result of a save cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The server accepted the changes and its document was published.
    Success,
    /// The save was rejected; the document was reloaded from the server.
    Failure(SaveFailure),
}

/// Result of [`SyncEngine::flush`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlushResult {
    /// There were no pending changes.
    NothingPending,
    /// A save was already in flight; pending edits go out after it.
    AlreadySaving,
    /// A save ran to completion.
    Completed(SaveOutcome),
}

/// A failed save, as reported on the error channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveFailure {
    /// Domain that failed to save.
    pub domain: String,
    /// The transport error.
    pub error: SyncError,
    /// The changes that were rejected.
    pub changes: ChangeSet,
}

impl SaveFailure {
    /// Message suitable for showing to the user.
    pub fn message(&self) -> String {
        format!("Failed to save {} settings", self.domain)
    }
}

/// Counters for one engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Edits recorded (each entry of `update_many` counts).
    pub edits_recorded: u64,
    /// Document replacements published to subscribers.
    pub documents_published: u64,
    /// Save requests dispatched.
    pub saves_attempted: u64,
    /// Saves the server accepted.
    pub saves_succeeded: u64,
    /// Saves that failed.
    pub saves_failed: u64,
    /// `load` calls.
    pub loads: u64,
    /// Recovery reloads after failed saves.
    pub reloads: u64,
    /// Time of the last successful save.
    pub last_save_time: Option<Instant>,
    /// Last transport error message.
    pub last_error: Option<String>,
}

struct EngineState<T> {
    buffer: PendingChangeBuffer,
    scheduler: SaveScheduler,
    /// Last document the server confirmed.
    confirmed: Option<T>,
    /// Bumped by `clear`; responses from an older epoch are dropped.
    epoch: u64,
    last_failure: Option<(SaveFailure, Instant)>,
    stats: SyncStats,
}

struct Inner<T, Tr> {
    config: EngineConfig,
    transport: Tr,
    runtime: Handle,
    default_document: Option<T>,
    document: watch::Sender<Option<T>>,
    phase: watch::Sender<SchedulerPhase>,
    errors: broadcast::Sender<SaveFailure>,
    state: Mutex<EngineState<T>>,
}

/// Keeps one settings document in sync with the settings API.
///
/// Edits are applied to the local document immediately and published to
/// subscribers; the engine batches them and sends one save once edits
/// stop for the configured debounce interval. The server's response
/// replaces the local document. A failed save triggers a reload, so the
/// document converges to what the server holds rather than to the
/// rejected guess.
///
/// The engine is cheap to clone; clones share the same document.
///
/// # Example
///
/// ```
/// use consign_sync_engine::{EngineConfig, MockTransport, SyncEngine};
/// use serde_json::{json, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let transport = MockTransport::<Value>::with_document(json!({}));
/// let engine = SyncEngine::new(EngineConfig::new("business"), transport).unwrap();
///
/// engine.load().await;
/// engine.update("thresholds.highValueSale", 500).unwrap();
/// assert_eq!(engine.get("thresholds.highValueSale"), Some(json!(500)));
///
/// engine.flush().await;
/// assert_eq!(engine.transport().save_count(), 1);
/// # }
/// ```
pub struct SyncEngine<T, Tr> {
    inner: Arc<Inner<T, Tr>>,
}

impl<T, Tr> Clone for SyncEngine<T, Tr> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, Tr> SyncEngine<T, Tr>
where
    T: SettingsDocument,
    Tr: SettingsTransport<T> + 'static,
{
    /// Creates an engine driven by the current Tokio runtime.
    pub fn new(config: EngineConfig, transport: Tr) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Self::with_runtime(config, transport, runtime)
    }

    /// Creates an engine whose debounce timer runs on `runtime`.
    pub fn with_runtime(config: EngineConfig, transport: Tr, runtime: Handle) -> SyncResult<Self> {
        let default_document = config
            .default_document
            .clone()
            .map(from_json::<T>)
            .transpose()?;
        let (document, _) = watch::channel(None);
        let (phase, _) = watch::channel(SchedulerPhase::Idle);
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));

        let state = EngineState {
            buffer: PendingChangeBuffer::new(),
            scheduler: SaveScheduler::new(config.debounce),
            confirmed: None,
            epoch: 0,
            last_failure: None,
            stats: SyncStats::default(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                runtime,
                default_document,
                document,
                phase,
                errors,
                state: Mutex::new(state),
            }),
        })
    }

    /// Fetches the document from the server.
    ///
    /// A missing document is the normal first-run state and publishes the
    /// configured default. Failures are logged and leave the document as
    /// it was.
    pub async fn load(&self) -> LoadStatus {
        let inner = &self.inner;
        let epoch = inner.state.lock().epoch;
        let response = inner.transport.load().await;

        let mut state = inner.state.lock();
        state.stats.loads += 1;
        if state.epoch != epoch {
            debug!(domain = %inner.config.domain, "discarding load issued before cache clear");
            return LoadStatus::Superseded;
        }

        match response {
            Ok(LoadResponse::Found(document)) => {
                state.confirmed = Some(document.clone());
                inner.publish(&mut state, Some(document));
                info!(domain = %inner.config.domain, "settings loaded");
                LoadStatus::Loaded
            }
            Ok(LoadResponse::NotFound) => {
                debug!(domain = %inner.config.domain, "no settings on server, using defaults");
                state.confirmed = None;
                inner.publish(&mut state, inner.default_document.clone());
                LoadStatus::NotFound
            }
            Err(error) => {
                warn!(domain = %inner.config.domain, %error, "failed to load settings");
                state.stats.last_error = Some(error.to_string());
                LoadStatus::Failed(error)
            }
        }
    }

    /// Sets `path` to `value` and schedules a save.
    ///
    /// Returns `Ok(false)` without doing anything if no document is
    /// loaded. The new document is published before this returns.
    pub fn update(&self, path: &str, value: impl Serialize) -> SyncResult<bool> {
        let path = FieldPath::parse(path)?;
        let value = serde_json::to_value(value)?;
        self.inner.apply(vec![(path, value)])
    }

    /// Sets a field addressed by a flat form key, resolved through the
    /// domain's alias table.
    pub fn update_key(&self, key: &str, value: impl Serialize) -> SyncResult<bool> {
        let path = self.inner.config.aliases.resolve(key)?;
        let value = serde_json::to_value(value)?;
        self.inner.apply(vec![(path, value)])
    }

    /// Applies several edits as one document replacement.
    ///
    /// Either every entry applies or none does.
    pub fn update_many<I, K, V>(&self, changes: I) -> SyncResult<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        let changes = changes
            .into_iter()
            .map(|(path, value)| {
                Ok((
                    FieldPath::parse(path.as_ref())?,
                    serde_json::to_value(value)?,
                ))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        self.inner.apply(changes)
    }

    /// Saves pending changes now instead of waiting for the debounce timer.
    ///
    /// Does nothing while idle or while a save is already in flight; an
    /// in-flight request is never cancelled. The save keeps running if
    /// the returned future is dropped.
    pub async fn flush(&self) -> FlushResult {
        let started = {
            let mut state = self.inner.state.lock();
            match state.scheduler.phase() {
                SchedulerPhase::Idle => return FlushResult::NothingPending,
                SchedulerPhase::Saving => return FlushResult::AlreadySaving,
                SchedulerPhase::Waiting => {
                    state.scheduler.on_flush();
                    self.inner.begin_cycle(&mut state)
                }
            }
        };

        let Some((request, epoch)) = started else {
            return FlushResult::NothingPending;
        };

        // detached: the cycle completes even if this future is dropped
        let changes = request.changes.clone();
        let inner = Arc::clone(&self.inner);
        let cycle = self
            .inner
            .runtime
            .spawn(async move { inner.run_cycle(request, epoch).await });

        match cycle.await {
            Ok(outcome) => FlushResult::Completed(outcome),
            Err(error) => {
                warn!(domain = %self.inner.config.domain, %error, "save task did not complete");
                FlushResult::Completed(SaveOutcome::Failure(SaveFailure {
                    domain: self.inner.config.domain.clone(),
                    error: SyncError::transport_fatal(error.to_string()),
                    changes,
                }))
            }
        }
    }

    /// Waits until no edits are pending and no save is in flight.
    pub async fn settled(&self) {
        let mut phase = self.inner.phase.subscribe();
        // the sender lives as long as `self`
        let _ = phase.wait_for(|phase| *phase == SchedulerPhase::Idle).await;
    }

    /// Drops the cached document and pending edits (e.g. on logout).
    ///
    /// A save already in flight completes on the wire but its response is
    /// ignored.
    pub fn clear(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.epoch += 1;
        let dropped = state.buffer.discard();
        state.scheduler.reset();
        state.confirmed = None;
        state.last_failure = None;
        inner.publish(&mut state, None);
        inner.publish_phase(&state);
        info!(domain = %inner.config.domain, dropped, "settings cache cleared");
    }

    /// The latest document, or `None` if none is loaded.
    pub fn current(&self) -> Option<T> {
        self.inner.document.borrow().clone()
    }

    /// Reads one field of the latest document.
    pub fn get(&self, path: &str) -> Option<Value> {
        let path = FieldPath::parse(path).ok()?;
        let document = to_json(self.inner.document.borrow().as_ref()?).ok()?;
        get_path(&document, &path).cloned()
    }

    /// Returns true if a document is loaded.
    pub fn is_loaded(&self) -> bool {
        self.inner.document.borrow().is_some()
    }

    /// Observes every document replacement.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.inner.document.subscribe()
    }

    /// Observes scheduler phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<SchedulerPhase> {
        self.inner.phase.subscribe()
    }

    /// Receives every save failure.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SaveFailure> {
        self.inner.errors.subscribe()
    }

    /// The most recent save failure, until it is older than the
    /// configured display TTL or a later save succeeds.
    pub fn last_error(&self) -> Option<SaveFailure> {
        let state = self.inner.state.lock();
        state
            .last_failure
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.inner.config.error_display_ttl)
            .map(|(failure, _)| failure.clone())
    }

    /// Current scheduler phase.
    pub fn phase(&self) -> SchedulerPhase {
        self.inner.state.lock().scheduler.phase()
    }

    /// Returns true if edits are waiting for the next save.
    pub fn has_pending_changes(&self) -> bool {
        !self.inner.state.lock().buffer.is_empty()
    }

    /// Engine counters.
    pub fn stats(&self) -> SyncStats {
        self.inner.state.lock().stats.clone()
    }

    /// Domain name from the configuration.
    pub fn domain(&self) -> &str {
        &self.inner.config.domain
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The transport this engine saves through.
    pub fn transport(&self) -> &Tr {
        &self.inner.transport
    }
}

impl<T, Tr> Inner<T, Tr>
where
    T: SettingsDocument,
    Tr: SettingsTransport<T> + 'static,
{
    fn apply(self: &Arc<Self>, changes: Vec<(FieldPath, Value)>) -> SyncResult<bool> {
        if changes.is_empty() {
            return Ok(false);
        }

        let mut state = self.state.lock();
        let current = self.document.borrow().clone();
        let Some(current) = current else {
            debug!(domain = %self.config.domain, "ignoring edit, no settings loaded");
            return Ok(false);
        };

        let mut working = to_json(&current)?;
        let mut buffer = state.buffer.clone();
        for (path, value) in &changes {
            set_in_place(&mut working, path, value.clone())?;
            buffer.record(path.clone(), value.clone())?;
        }
        let next = from_json::<T>(working)?;

        state.buffer = buffer;
        state.stats.edits_recorded += changes.len() as u64;
        self.publish(&mut state, Some(next));
        state.scheduler.on_edit(&self.runtime, self.timer_callback());
        self.publish_phase(&state);

        debug!(
            domain = %self.config.domain,
            edits = changes.len(),
            pending = state.buffer.len(),
            "settings edited"
        );
        Ok(true)
    }

    fn timer_callback(self: &Arc<Self>) -> impl FnOnce(u64) -> TimerFuture + Send + 'static {
        let inner = Arc::clone(self);
        move |generation| inner.on_timer(generation)
    }

    fn on_timer(self: Arc<Self>, generation: u64) -> TimerFuture {
        Box::pin(async move {
            let started = {
                let mut state = self.state.lock();
                if state.scheduler.on_timer(generation) {
                    self.begin_cycle(&mut state)
                } else {
                    None
                }
            };
            if let Some((request, epoch)) = started {
                self.run_cycle(request, epoch).await;
            }
        })
    }

    /// Snapshots the buffer and moves to `Saving`. Returns `None` when
    /// there is nothing to send or a save is already in flight.
    fn begin_cycle(&self, state: &mut EngineState<T>) -> Option<(SaveRequest, u64)> {
        if state.scheduler.phase().is_saving() {
            return None;
        }
        if state.buffer.is_empty() {
            state.scheduler.reset();
            self.publish_phase(state);
            return None;
        }

        let changes = state.buffer.take();
        // the local document can be a server response newer than these edits
        let current = self
            .document
            .borrow()
            .as_ref()
            .and_then(|document| to_json(document).ok())
            .unwrap_or(Value::Null);
        let document = changes.apply_to(&current).unwrap_or(current);

        state.scheduler.begin_save();
        state.stats.saves_attempted += 1;
        self.publish_phase(state);

        debug!(
            domain = %self.config.domain,
            generation = changes.generation(),
            paths = changes.len(),
            coalesced = changes.edits(),
            "saving settings"
        );
        Some((SaveRequest { changes, document }, state.epoch))
    }

    async fn run_cycle(self: &Arc<Self>, request: SaveRequest, epoch: u64) -> SaveOutcome {
        let result = self.transport.save_partial(&request).await;

        let outcome = match result {
            Ok(document) => {
                self.accept(document, epoch);
                SaveOutcome::Success
            }
            Err(error) => {
                let failure = SaveFailure {
                    domain: self.config.domain.clone(),
                    error,
                    changes: request.changes,
                };
                self.report(&failure, epoch);
                self.recover(epoch).await;
                SaveOutcome::Failure(failure)
            }
        };

        let mut state = self.state.lock();
        let pending = !state.buffer.is_empty();
        state
            .scheduler
            .finish_save(pending, &self.runtime, self.timer_callback());
        self.publish_phase(&state);
        outcome
    }

    fn accept(&self, document: T, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(domain = %self.config.domain, "discarding save response after cache clear");
            return;
        }
        state.stats.saves_succeeded += 1;
        state.stats.last_save_time = Some(Instant::now());
        state.last_failure = None;
        state.confirmed = Some(document.clone());
        self.publish(&mut state, Some(document));
        debug!(domain = %self.config.domain, "settings saved");
    }

    fn report(&self, failure: &SaveFailure, epoch: u64) {
        let mut state = self.state.lock();
        state.stats.saves_failed += 1;
        state.stats.last_error = Some(failure.error.to_string());
        warn!(
            domain = %self.config.domain,
            error = %failure.error,
            paths = failure.changes.len(),
            "failed to save settings, reloading"
        );
        if state.epoch != epoch {
            return;
        }
        state.last_failure = Some((failure.clone(), Instant::now()));
        // no receivers is fine
        let _ = self.errors.send(failure.clone());
    }

    async fn recover(&self, epoch: u64) {
        let response = self.transport.reload().await;

        let mut state = self.state.lock();
        state.stats.reloads += 1;
        if state.epoch != epoch {
            return;
        }

        match response {
            Ok(LoadResponse::Found(document)) => {
                state.confirmed = Some(document.clone());
                self.publish(&mut state, Some(document));
            }
            Ok(LoadResponse::NotFound) => {
                state.confirmed = None;
                self.publish(&mut state, self.default_document.clone());
            }
            Err(error) => {
                warn!(domain = %self.config.domain, %error, "reload after failed save failed");
                state.stats.last_error = Some(error.to_string());
                if let Some(confirmed) = state.confirmed.clone() {
                    self.publish(&mut state, Some(confirmed));
                }
            }
        }
    }

    /// Replaces the document. Callers hold the state lock, which keeps
    /// the engine the single writer of the cell.
    fn publish(&self, state: &mut EngineState<T>, document: Option<T>) {
        state.stats.documents_published += 1;
        self.document.send_replace(document);
    }

    fn publish_phase(&self, state: &EngineState<T>) {
        let phase = state.scheduler.phase();
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SettingsDomain;
    use crate::transport::MockTransport;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    type TestEngine = SyncEngine<Value, Arc<MockTransport<Value>>>;

    fn engine_with(transport: MockTransport<Value>) -> (TestEngine, Arc<MockTransport<Value>>) {
        let transport = Arc::new(transport);
        let engine = SyncEngine::new(EngineConfig::new("business"), Arc::clone(&transport)).unwrap();
        (engine, transport)
    }

    async fn loaded(document: Value) -> (TestEngine, Arc<MockTransport<Value>>) {
        let (engine, transport) = engine_with(MockTransport::with_document(document));
        assert_eq!(engine.load().await, LoadStatus::Loaded);
        (engine, transport)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn engine_requires_runtime() {
        let result = SyncEngine::<Value, _>::new(EngineConfig::default(), MockTransport::new());
        assert!(matches!(result, Err(SyncError::NoRuntime)));
    }

    #[tokio::test]
    async fn invalid_default_document_is_rejected() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Strict {
            rate: u32,
        }
        let config = EngineConfig::new("accounting").with_default_document(json!({"rate": "x"}));
        let result = SyncEngine::<Strict, _>::new(config, MockTransport::new());
        assert!(matches!(result, Err(SyncError::Codec(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn update_is_visible_before_any_save() {
        let (engine, transport) = loaded(json!({})).await;

        assert!(engine.update("thresholds.highValueSale", 100).unwrap());

        assert_eq!(engine.get("thresholds.highValueSale"), Some(json!(100)));
        assert_eq!(engine.current(), Some(json!({"thresholds": {"highValueSale": 100}})));
        assert_eq!(transport.save_count(), 0);
        assert_eq!(engine.phase(), SchedulerPhase::Waiting);
        assert!(engine.has_pending_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn update_without_document_is_a_no_op() {
        let (engine, transport) = engine_with(MockTransport::new());
        assert!(!engine.update("a", 1).unwrap());

        assert_eq!(engine.load().await, LoadStatus::NotFound);
        assert!(!engine.update("a", 1).unwrap());
        assert_eq!(engine.phase(), SchedulerPhase::Idle);

        sleep_ms(2_000).await;
        assert_eq!(transport.save_count(), 0);
        assert!(engine.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_in_a_burst_coalesce_into_one_save() {
        let (engine, transport) = loaded(json!({})).await;

        engine.update("thresholds.highValueSale", 100).unwrap();
        sleep_ms(200).await;
        engine.update("thresholds.highValueSale", 500).unwrap();
        assert_eq!(engine.get("thresholds.highValueSale"), Some(json!(500)));

        sleep_ms(799).await;
        assert_eq!(transport.save_count(), 0);

        sleep_ms(2).await;
        let saves = transport.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].changes.len(), 1);
        assert_eq!(saves[0].changes.get("thresholds.highValueSale"), Some(&json!(500)));
        assert_eq!(saves[0].changes.edits(), 2);
        assert_eq!(engine.phase(), SchedulerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_edits_defer_the_save() {
        let (engine, transport) = loaded(json!({})).await;

        for value in 0..10 {
            engine.update("notify.threshold", value).unwrap();
            sleep_ms(500).await;
            assert_eq!(transport.save_count(), 0);
        }

        sleep_ms(400).await;
        let saves = transport.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].changes.get("notify.threshold"), Some(&json!(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_saves_immediately_and_cancels_the_timer() {
        let (engine, transport) = loaded(json!({"name": "Second Act"})).await;

        engine.update("tax.salesTaxRate", 8.25).unwrap();
        engine.update("receipt.footer", "Thanks!").unwrap();

        assert_eq!(
            engine.flush().await,
            FlushResult::Completed(SaveOutcome::Success)
        );
        assert_eq!(transport.save_count(), 1);
        assert_eq!(engine.phase(), SchedulerPhase::Idle);

        sleep_ms(2_000).await;
        assert_eq!(transport.save_count(), 1);
        assert_eq!(engine.flush().await, FlushResult::NothingPending);
        assert_eq!(
            transport.document(),
            Some(json!({
                "name": "Second Act",
                "tax": {"salesTaxRate": 8.25},
                "receipt": {"footer": "Thanks!"}
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn edits_during_a_save_go_out_in_the_next_save() {
        let (engine, transport) = loaded(json!({})).await;
        let gate = transport.hold_saves();

        engine.update("a", 1).unwrap();
        let flushing = tokio::spawn({
            let engine = engine.clone();
            async move { engine.flush().await }
        });
        transport.wait_for_saves(1).await;
        assert_eq!(engine.phase(), SchedulerPhase::Saving);

        engine.update("b", 2).unwrap();
        assert_eq!(engine.get("b"), Some(json!(2)));
        assert!(transport.saves()[0].changes.get("b").is_none());

        gate.release_one();
        assert_eq!(
            flushing.await.unwrap(),
            FlushResult::Completed(SaveOutcome::Success)
        );

        // the server's document wins over the newer optimistic edit...
        assert_eq!(engine.current(), Some(json!({"a": 1})));
        assert_eq!(engine.phase(), SchedulerPhase::Waiting);

        // ...which is resent after the next quiet period
        gate.release_one();
        sleep_ms(801).await;
        let saves = transport.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].changes.get("b"), Some(&json!(2)));
        assert!(saves[1].changes.get("a").is_none());
        // whole-document saves carry the resent edit on top of the server copy
        assert_eq!(saves[1].document, json!({"a": 1, "b": 2}));
        assert_eq!(engine.current(), Some(json!({"a": 1, "b": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_flush_still_finishes_the_save() {
        let (engine, transport) = loaded(json!({})).await;
        let _gate = transport.hold_saves();

        engine.update("a", 1).unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(100), engine.flush()).await;
        assert!(timed_out.is_err());
        assert_eq!(engine.phase(), SchedulerPhase::Saving);

        transport.resume_saves();
        engine.update("b", 2).unwrap();
        sleep_ms(10_000).await;

        assert_eq!(transport.save_count(), 2);
        assert_eq!(engine.phase(), SchedulerPhase::Idle);
        assert!(!engine.has_pending_changes());
        assert_eq!(transport.document(), Some(json!({"a": 1, "b": 2})));
        assert_eq!(engine.current(), transport.document());
    }

    #[tokio::test(start_paused = true)]
    async fn object_value_replaces_the_subtree() {
        let (engine, transport) =
            loaded(json!({"tax": {"rate": 5, "inclusive": true}, "name": "Shop"})).await;

        engine.update("tax", json!({"rate": 7})).unwrap();
        assert_eq!(engine.current(), Some(json!({"tax": {"rate": 7}, "name": "Shop"})));

        engine.flush().await;
        assert_eq!(transport.document(), Some(json!({"tax": {"rate": 7}, "name": "Shop"})));
        assert_eq!(engine.current(), transport.document());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_save_is_in_flight() {
        let (engine, transport) = loaded(json!({})).await;
        let gate = transport.hold_saves();

        engine.update("a", 1).unwrap();
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.flush().await }
        });
        transport.wait_for_saves(1).await;

        assert_eq!(engine.flush().await, FlushResult::AlreadySaving);
        assert_eq!(transport.save_count(), 1);

        gate.release_one();
        assert!(matches!(
            first.await.unwrap(),
            FlushResult::Completed(SaveOutcome::Success)
        ));
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_document_is_authoritative() {
        let transport = MockTransport::with_document(json!({"tax": {"rate": 5}}))
            .with_normalizer(|doc| {
                if let Some(rate) = doc["tax"]["rate"].as_f64() {
                    doc["tax"]["rate"] = json!(rate.min(25.0));
                }
                doc["updatedBy"] = json!("server");
            });
        let (engine, transport) = engine_with(transport);
        engine.load().await;

        engine.update("tax.rate", 99).unwrap();
        engine.flush().await;

        assert_eq!(engine.current(), transport.document());
        assert_eq!(
            engine.current(),
            Some(json!({"tax": {"rate": 25.0}, "updatedBy": "server"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_reloads_from_server() {
        let (engine, transport) = loaded(json!({"tax": {"rate": 5}})).await;
        let mut errors = engine.subscribe_errors();
        transport.fail_next_save(SyncError::Status {
            status: 422,
            message: "rate out of range".into(),
        });

        engine.update("tax.rate", 900).unwrap();
        assert_eq!(engine.get("tax.rate"), Some(json!(900)));

        let result = engine.flush().await;
        let FlushResult::Completed(SaveOutcome::Failure(failure)) = result else {
            panic!("expected a failed save, got {result:?}");
        };
        assert_eq!(failure.changes.get("tax.rate"), Some(&json!(900)));
        assert_eq!(failure.message(), "Failed to save business settings");

        assert_eq!(engine.current(), Some(json!({"tax": {"rate": 5}})));
        assert_eq!(transport.reload_count(), 1);
        assert_eq!(errors.recv().await.unwrap(), failure);
        assert_eq!(engine.phase(), SchedulerPhase::Idle);

        let stats = engine.stats();
        assert_eq!(stats.saves_failed, 1);
        assert_eq!(stats.reloads, 1);

        // the failed snapshot is not retried
        sleep_ms(5_000).await;
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_rolls_back_to_last_confirmed_document() {
        let (engine, transport) = loaded(json!({"digest": {"daily": false}})).await;
        transport.fail_next_save(SyncError::transport_retryable("connection reset"));
        transport.fail_next_reload(SyncError::Timeout);

        engine.update("digest.daily", true).unwrap();
        engine.flush().await;

        assert_eq!(engine.current(), Some(json!({"digest": {"daily": false}})));
        assert_eq!(engine.stats().last_error.as_deref(), Some("operation timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn save_errors_expire() {
        let (engine, transport) = loaded(json!({})).await;
        transport.fail_next_save(SyncError::transport_retryable("offline"));

        engine.update("a", 1).unwrap();
        engine.flush().await;
        assert!(engine.last_error().is_some());

        sleep_ms(4_000).await;
        assert!(engine.last_error().is_some());

        sleep_ms(1_001).await;
        assert!(engine.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_save_clears_reported_error() {
        let (engine, transport) = loaded(json!({})).await;
        transport.fail_next_save(SyncError::transport_retryable("offline"));

        engine.update("a", 1).unwrap();
        engine.flush().await;
        assert!(engine.last_error().is_some());

        engine.update("a", 2).unwrap();
        engine.flush().await;
        assert!(engine.last_error().is_none());
        assert_eq!(engine.current(), Some(json!({"a": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn update_many_publishes_once() {
        let (engine, transport) = loaded(json!({})).await;
        let before = engine.stats().documents_published;

        engine
            .update_many([
                ("channels.email.sale", true),
                ("channels.sms.sale", true),
                ("channels.push.sale", true),
            ])
            .unwrap();

        assert_eq!(engine.stats().documents_published, before + 1);
        assert_eq!(engine.stats().edits_recorded, 3);

        engine.flush().await;
        assert_eq!(transport.saves()[0].changes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn update_many_is_all_or_nothing() {
        let (engine, _transport) = loaded(json!({"tags": ["sale"]})).await;

        let result = engine.update_many([("tax.rate", json!(5)), ("tags.first", json!("x"))]);
        assert!(matches!(result, Err(SyncError::PathConflict { .. })));
        assert_eq!(engine.current(), Some(json!({"tags": ["sale"]})));
        assert!(!engine.has_pending_changes());
        assert_eq!(engine.phase(), SchedulerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_documents_reject_mismatched_values() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Thresholds {
            high_value_sale: u32,
        }
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Business {
            thresholds: Thresholds,
        }

        let transport = Arc::new(MockTransport::<Business>::with_document(
            json!({"thresholds": {"highValueSale": 100}}),
        ));
        let engine = SyncEngine::new(EngineConfig::new("business"), Arc::clone(&transport)).unwrap();
        engine.load().await;

        assert!(matches!(
            engine.update("thresholds.highValueSale", "lots"),
            Err(SyncError::Codec(_))
        ));
        assert!(engine.update("thresholds.highValueSale", 250).unwrap());
        assert_eq!(
            engine.current().map(|b| b.thresholds.high_value_sale),
            Some(250)
        );

        engine.flush().await;
        assert_eq!(
            transport.document(),
            Some(json!({"thresholds": {"highValueSale": 250}}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flat_keys_resolve_through_aliases() {
        let transport = Arc::new(MockTransport::<Value>::with_document(json!({})));
        let engine = SyncEngine::new(
            EngineConfig::for_domain(SettingsDomain::Business),
            Arc::clone(&transport),
        )
        .unwrap();
        engine.load().await;

        engine.update_key("salesTaxRate", 7.5).unwrap();
        engine.update_key("receipt.footer", "Bye").unwrap();

        assert_eq!(engine.get("tax.salesTaxRate"), Some(json!(7.5)));
        assert_eq!(engine.get("receipt.footer"), Some(json!("Bye")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_document_falls_back_to_default() {
        let transport = Arc::new(MockTransport::<Value>::new());
        let config = EngineConfig::new("notifications")
            .with_default_document(json!({"digest": {"daily": true}}));
        let engine = SyncEngine::new(config, Arc::clone(&transport)).unwrap();

        assert_eq!(engine.load().await, LoadStatus::NotFound);
        assert_eq!(engine.current(), Some(json!({"digest": {"daily": true}})));

        engine.update("digest.daily", false).unwrap();
        engine.flush().await;
        assert_eq!(transport.document(), Some(json!({"digest": {"daily": false}})));
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_is_passive() {
        let (engine, transport) = engine_with(MockTransport::with_document(json!({})));
        transport.fail_next_load(SyncError::transport_retryable("dns"));

        assert!(matches!(engine.load().await, LoadStatus::Failed(_)));
        assert!(!engine.is_loaded());
        assert!(engine.last_error().is_none());

        assert_eq!(engine.load().await, LoadStatus::Loaded);
        assert!(engine.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_pending_edits() {
        let (engine, transport) = loaded(json!({})).await;

        engine.update("a", 1).unwrap();
        engine.clear();

        assert!(engine.current().is_none());
        assert!(!engine.has_pending_changes());
        assert_eq!(engine.phase(), SchedulerPhase::Idle);

        sleep_ms(2_000).await;
        assert_eq!(transport.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_in_flight_response() {
        let (engine, transport) = loaded(json!({})).await;
        let gate = transport.hold_saves();

        engine.update("a", 1).unwrap();
        let flushing = tokio::spawn({
            let engine = engine.clone();
            async move { engine.flush().await }
        });
        transport.wait_for_saves(1).await;

        engine.clear();
        assert_eq!(engine.phase(), SchedulerPhase::Saving);

        gate.release_one();
        flushing.await.unwrap();
        assert!(engine.current().is_none());
        assert_eq!(engine.phase(), SchedulerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_waits_for_the_debounced_save() {
        let (engine, transport) = loaded(json!({})).await;
        let mut documents = engine.subscribe();
        drop(documents.borrow_and_update());

        engine.update("a", 1).unwrap();
        assert!(documents.has_changed().unwrap());

        engine.settled().await;
        assert_eq!(transport.save_count(), 1);
        assert_eq!(engine.stats().saves_succeeded, 1);
        assert!(engine.stats().last_save_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn phase_changes_are_observable() {
        let (engine, _transport) = loaded(json!({})).await;
        let mut phases = engine.subscribe_phase();
        assert_eq!(*phases.borrow_and_update(), SchedulerPhase::Idle);

        engine.update("a", 1).unwrap();
        assert_eq!(*phases.borrow_and_update(), SchedulerPhase::Waiting);

        engine.flush().await;
        assert_eq!(*phases.borrow_and_update(), SchedulerPhase::Idle);
    }
}
