//! # Consign Settings Server
//!
//! Reference in-memory settings API for the Consign sync engine.
//!
//! This crate provides:
//! - One JSON document per settings resource
//! - `GET`, `PATCH` (values keyed by field path, each replacing what is
//!   stored at that path) and `PUT` (replace the document)
//! - Per-resource normalizers for server-side defaulting and validation
//! - A [`consign_sync_engine::LoopbackServer`] implementation, so an
//!   engine can talk to it in-process
//!
//! # Status codes
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 200 | Full stored document |
//! | 400 | Malformed body, or rejected by the normalizer |
//! | 404 | Unknown resource, or nothing stored yet |
//! | 405 | Write method the resource does not accept |
//! | 413 | Body larger than the configured limit |
//! | 500 | Internal error |

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::{ServerConfig, DEFAULT_MAX_BODY_SIZE};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, Normalizer, RequestHandler, RequestStats};
pub use server::SettingsServer;
pub use store::SettingsStore;
