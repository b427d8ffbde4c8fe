//! Request handlers for settings resources.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::SettingsStore;
use consign_sync_engine::{ChangeSet, HttpMethod, HttpResponse, WriteMode};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Server-side defaulting and validation, run on every write before the
/// document is stored.
pub trait Normalizer: Send + Sync {
    /// Rewrites `document` in place, or rejects it.
    fn normalize(&self, document: &mut Value) -> ServerResult<()>;
}

impl<F> Normalizer for F
where
    F: Fn(&mut Value) -> ServerResult<()> + Send + Sync,
{
    fn normalize(&self, document: &mut Value) -> ServerResult<()> {
        self(document)
    }
}

/// Snapshot of request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// GET requests served.
    pub gets: u64,
    /// PATCH requests served.
    pub patches: u64,
    /// PUT requests served.
    pub puts: u64,
    /// Requests answered with an error status.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct RequestCounters {
    gets: AtomicU64,
    patches: AtomicU64,
    puts: AtomicU64,
    rejected: AtomicU64,
}

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Document storage (shared across all handlers).
    pub store: Arc<SettingsStore>,
    normalizers: RwLock<HashMap<String, Arc<dyn Normalizer>>>,
    counters: RequestCounters,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<SettingsStore>) -> Self {
        Self {
            config,
            store,
            normalizers: RwLock::new(HashMap::new()),
            counters: RequestCounters::default(),
        }
    }

    /// Installs the normalizer for `resource`, replacing any previous one.
    pub fn set_normalizer(&self, resource: impl Into<String>, normalizer: impl Normalizer + 'static) {
        self.normalizers
            .write()
            .insert(resource.into(), Arc::new(normalizer));
    }

    /// Returns the request counters.
    pub fn stats(&self) -> RequestStats {
        RequestStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            patches: self.counters.patches.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn normalizer(&self, resource: &str) -> Option<Arc<dyn Normalizer>> {
        self.normalizers.read().get(resource).cloned()
    }
}

/// Handler for settings requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a GET: returns the stored document.
    pub fn handle_get(&self, resource: &str) -> ServerResult<Value> {
        self.context.counters.gets.fetch_add(1, Ordering::Relaxed);
        if self.context.config.write_mode(resource).is_none() {
            return Err(ServerError::NotFound(format!("unknown resource {resource}")));
        }
        self.context
            .store
            .get(resource)
            .ok_or_else(|| ServerError::NotFound(format!("no settings stored for {resource}")))
    }

    /// Handles a PATCH: sets each field path of the body in the stored
    /// document (or the resource default) and returns the result.
    ///
    /// Body keys are field paths; each value replaces whatever is stored
    /// at its path, siblings untouched.
    pub fn handle_patch(&self, resource: &str, body: Option<&[u8]>) -> ServerResult<Value> {
        self.context.counters.patches.fetch_add(1, Ordering::Relaxed);
        self.check_write(HttpMethod::Patch, resource)?;
        let changes = ChangeSet::from_patch_body(&self.parse_body(body)?)?;
        let base = self.context.config.defaults.get(resource);

        self.write(resource, |current| {
            let document = current
                .or(base)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            Ok(changes.apply_to(&document)?)
        })
    }

    /// Handles a PUT: replaces the stored document.
    pub fn handle_put(&self, resource: &str, body: Option<&[u8]>) -> ServerResult<Value> {
        self.context.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.check_write(HttpMethod::Put, resource)?;
        let document = self.parse_body(body)?;
        self.write(resource, |_| Ok(document))
    }

    /// Dispatches a request and renders the result as a response.
    pub fn handle(&self, method: HttpMethod, path: &str, body: Option<&[u8]>) -> HttpResponse {
        let resource = path.split('?').next().unwrap_or(path);
        let result = match method {
            HttpMethod::Get => self.handle_get(resource),
            HttpMethod::Patch => self.handle_patch(resource, body),
            HttpMethod::Put => self.handle_put(resource, body),
        };

        match result {
            Ok(document) => HttpResponse::json(&document),
            Err(error) => {
                self.context.counters.rejected.fetch_add(1, Ordering::Relaxed);
                if error.is_server_error() {
                    warn!(%method, resource, %error, "settings request failed");
                } else {
                    debug!(%method, resource, %error, "settings request rejected");
                }
                HttpResponse::new(error.status_code(), error.to_string())
            }
        }
    }

    fn check_write(&self, method: HttpMethod, resource: &str) -> ServerResult<()> {
        let expected = match method {
            HttpMethod::Put => WriteMode::Put,
            _ => WriteMode::Patch,
        };
        match self.context.config.write_mode(resource) {
            None => Err(ServerError::NotFound(format!("unknown resource {resource}"))),
            Some(mode) if mode != expected => Err(ServerError::MethodNotAllowed {
                method: method.to_string(),
                resource: resource.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn parse_body(&self, body: Option<&[u8]>) -> ServerResult<Value> {
        let body = body.ok_or_else(|| ServerError::InvalidRequest("missing body".into()))?;
        let limit = self.context.config.max_body_size;
        if body.len() > limit {
            return Err(ServerError::PayloadTooLarge {
                size: body.len(),
                limit,
            });
        }

        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(ServerError::InvalidRequest(
                "settings body must be a JSON object".into(),
            ));
        }
        Ok(value)
    }

    fn write(
        &self,
        resource: &str,
        build: impl FnOnce(Option<&Value>) -> ServerResult<Value>,
    ) -> ServerResult<Value> {
        let normalizer = self.context.normalizer(resource);
        let stored = self.context.store.update(resource, |current| {
            let mut document = build(current)?;
            if let Some(normalizer) = &normalizer {
                normalizer.normalize(&mut document)?;
            }
            Ok::<_, ServerError>(document)
        })?;
        debug!(resource, "settings stored");
        Ok(stored)
    }
}
