//! Main settings server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, Normalizer, RequestHandler, RequestStats};
use crate::store::SettingsStore;
use consign_sync_engine::{HttpMethod, HttpResponse, LoopbackServer};
use serde_json::Value;
use std::sync::Arc;

/// The reference settings server.
///
/// Serves one JSON document per settings resource: `GET` returns it,
/// `PATCH` sets the changed field paths in it and `PUT` replaces it. Every
/// write runs through the resource's normalizer and answers with the
/// stored document.
///
/// # Example
///
/// ```
/// use consign_settings_server::{ServerConfig, SettingsServer};
/// use serde_json::json;
///
/// let server = SettingsServer::new(ServerConfig::default());
/// let stored = server
///     .handle_patch("/api/settings/business", br#"{"tax.salesTaxRate": 7}"#)
///     .unwrap();
/// assert_eq!(stored, json!({"tax": {"salesTaxRate": 7}}));
/// ```
pub struct SettingsServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SettingsServer {
    /// Creates a new settings server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(SettingsStore::new()))
    }

    /// Creates a settings server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<SettingsStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Installs the normalizer for `resource`.
    pub fn with_normalizer(self, resource: impl Into<String>, normalizer: impl Normalizer + 'static) -> Self {
        self.context.set_normalizer(resource, normalizer);
        self
    }

    /// Handles a GET request.
    pub fn handle_get(&self, resource: &str) -> ServerResult<Value> {
        self.handler.handle_get(resource)
    }

    /// Handles a PATCH request.
    pub fn handle_patch(&self, resource: &str, body: &[u8]) -> ServerResult<Value> {
        self.handler.handle_patch(resource, Some(body))
    }

    /// Handles a PUT request.
    pub fn handle_put(&self, resource: &str, body: &[u8]) -> ServerResult<Value> {
        self.handler.handle_put(resource, Some(body))
    }

    /// Dispatches a request and renders the response.
    pub fn handle_request(&self, method: HttpMethod, path: &str, body: Option<&[u8]>) -> HttpResponse {
        self.handler.handle(method, path, body)
    }

    /// Returns the stored document of `resource`.
    pub fn document(&self, resource: &str) -> Option<Value> {
        self.context.store.get(resource)
    }

    /// Replaces the stored document of `resource`, bypassing normalization.
    pub fn set_document(&self, resource: impl Into<String>, document: Value) {
        self.context.store.put(resource, document);
    }

    /// Deletes the stored document of `resource`.
    pub fn remove_document(&self, resource: &str) -> Option<Value> {
        self.context.store.remove(resource)
    }

    /// Returns the document store.
    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.context.store
    }

    /// Returns the request counters.
    pub fn stats(&self) -> RequestStats {
        self.context.stats()
    }
}

impl LoopbackServer for SettingsServer {
    fn handle(&self, method: HttpMethod, path: &str, body: Option<&[u8]>) -> HttpResponse {
        self.handle_request(method, path, body)
    }
}
