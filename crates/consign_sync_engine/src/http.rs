//! HTTP transport implementation.
//!
//! Maps the settings transport contract onto a REST resource:
//! `GET` to load (404 means "no document yet"), and `PATCH` with the
//! changed values keyed by field path or `PUT` with the whole document
//! to save. Bodies are JSON. The actual HTTP client is abstracted behind
//! [`HttpClient`] so any HTTP library, or an in-process server, can carry
//! the requests.

use crate::config::HttpTransportConfig;
use crate::document::SettingsDocument;
use crate::domain::WriteMode;
use crate::error::{SyncError, SyncResult};
use crate::transport::{LoadResponse, SaveRequest, SettingsTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// HTTP methods used by the settings API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// Fetch the document.
    Get,
    /// Apply a partial update.
    Patch,
    /// Replace the document.
    Put,
}

impl HttpMethod {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

/// A response from the settings API.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates a 200 response with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport (reqwest,
/// hyper, a browser fetch bridge, ...). Errors are connection-level
/// failures; HTTP error statuses come back as responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based settings transport for one resource.
pub struct HttpTransport<C> {
    config: HttpTransportConfig,
    client: C,
    closed: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(config: HttpTransportConfig, client: C) -> Self {
        Self {
            config,
            client,
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the transport configuration.
    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    /// Returns the full resource URL.
    pub fn url(&self) -> String {
        self.config.url()
    }

    /// Returns the last connection error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Checks if requests can be sent.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Refuses all further requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Sends a request, retrying retryable failures per the retry config.
    async fn execute(&self, method: HttpMethod, body: Option<Vec<u8>>) -> SyncResult<HttpResponse> {
        let request = HttpRequest {
            method,
            url: self.url(),
            body,
        };
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            match self.attempt(request.clone()).await {
                Err(error) if error.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(%method, url = %request.url, %error, attempt, ?delay, "retrying settings request");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn attempt(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let response = match tokio::time::timeout(self.config.timeout, self.client.send(request)).await {
            Err(_) => return Err(SyncError::Timeout),
            Ok(Err(message)) => {
                *self.last_error.write() = Some(message.clone());
                return Err(SyncError::transport_retryable(message));
            }
            Ok(Ok(response)) => response,
        };
        *self.last_error.write() = None;

        if response.is_success() || response.status == 404 {
            Ok(response)
        } else {
            Err(SyncError::Status {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            })
        }
    }

    async fn fetch<T: SettingsDocument>(&self) -> SyncResult<LoadResponse<T>> {
        let response = self.execute(HttpMethod::Get, None).await?;
        if response.status == 404 {
            return Ok(LoadResponse::NotFound);
        }
        Ok(LoadResponse::Found(serde_json::from_slice(&response.body)?))
    }
}

#[async_trait]
impl<T, C> SettingsTransport<T> for HttpTransport<C>
where
    T: SettingsDocument,
    C: HttpClient,
{
    async fn load(&self) -> SyncResult<LoadResponse<T>> {
        self.fetch().await
    }

    async fn save_partial(&self, request: &SaveRequest) -> SyncResult<T> {
        let (method, body) = match self.config.write_mode {
            WriteMode::Patch => (HttpMethod::Patch, request.changes.to_patch_body()),
            WriteMode::Put => (HttpMethod::Put, request.document.clone()),
        };
        let body = serde_json::to_vec(&body)?;

        let response = self.execute(method, Some(body)).await?;
        if response.status == 404 {
            return Err(SyncError::Status {
                status: 404,
                message: format!("{} not found", self.config.resource),
            });
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn reload(&self) -> SyncResult<LoadResponse<T>> {
        self.fetch().await
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request for `path` and returns the response.
    fn handle(&self, method: HttpMethod, path: &str, body: Option<&[u8]>) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, method: HttpMethod, path: &str, body: Option<&[u8]>) -> HttpResponse {
        (**self).handle(method, path, body)
    }
}

/// An HTTP client that routes requests directly to an in-process server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Strips scheme and authority from a URL.
fn url_path(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => url,
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        Ok(self
            .server
            .handle(request.method, url_path(&request.url), request.body.as_deref()))
    }
}
