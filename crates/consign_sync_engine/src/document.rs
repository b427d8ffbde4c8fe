//! The settings document abstraction.

use crate::error::SyncResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A settings document type the engine can hold and patch.
///
/// Documents are edited through their JSON form, so any serde type
/// works; `serde_json::Value` serves untyped domains.
pub trait SettingsDocument: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SettingsDocument for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Encodes a document into its JSON form.
pub fn to_json<T: SettingsDocument>(document: &T) -> SyncResult<Value> {
    Ok(serde_json::to_value(document)?)
}

/// Decodes a document from its JSON form.
pub fn from_json<T: SettingsDocument>(value: Value) -> SyncResult<T> {
    Ok(serde_json::from_value(value)?)
}
