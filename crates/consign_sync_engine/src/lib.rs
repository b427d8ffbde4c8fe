//! # Consign Sync Engine
//!
//! Optimistic, debounced synchronization of settings documents.
//!
//! This crate provides:
//! - Field-path addressing of nested settings documents
//! - A pending-change buffer that coalesces edits per path
//! - A debounce and in-flight save scheduler
//! - The [`SyncEngine`] that ties them to a transport
//! - An HTTP transport over a pluggable [`HttpClient`]
//!
//! ## Architecture
//!
//! Each settings domain (business profile, notifications, storefront, ...)
//! gets its own engine. An edit:
//! 1. Replaces the local document and notifies subscribers immediately
//! 2. Lands in the pending-change buffer, overwriting older edits of the
//!    same path
//! 3. Restarts the debounce timer
//!
//! When the timer fires (or on [`SyncEngine::flush`]) the buffer is taken
//! as one save. The server's response replaces the local document; a
//! failure is reported and the document is reloaded.
//!
//! ## Key Invariants
//!
//! - The server is authoritative
//! - At most one save is in flight per engine
//! - Edits made during a save go out in the next save, never lost
//! - A save contains the latest value of every changed path

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod config;
mod document;
mod domain;
mod engine;
mod error;
mod http;
mod path;
mod scheduler;
mod transport;

pub use buffer::{ChangeSet, PendingChangeBuffer};
pub use config::{
    EngineConfig, HttpTransportConfig, RetryConfig, DEFAULT_DEBOUNCE, DEFAULT_ERROR_TTL,
};
pub use document::{from_json, to_json, SettingsDocument};
pub use domain::{SettingsDomain, WriteMode};
pub use engine::{FlushResult, LoadStatus, SaveFailure, SaveOutcome, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer,
};
pub use path::{expand, get_path, set_in_place, set_path, FieldPath, PathAliases, PATH_SEPARATOR};
pub use scheduler::SchedulerPhase;
pub use transport::{LoadResponse, MockTransport, SaveGate, SaveRequest, SettingsTransport};
