//! Server configuration.

use consign_sync_engine::{SettingsDomain, WriteMode};
use serde_json::Value;
use std::collections::HashMap;

/// Default maximum request body size.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

/// Configuration for the settings server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Known resources and the write method each accepts.
    pub resources: HashMap<String, WriteMode>,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
    /// Base documents a first PATCH is applied to, per resource.
    pub defaults: HashMap<String, Value>,
}

impl ServerConfig {
    /// Creates a configuration with no resources.
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            defaults: HashMap::new(),
        }
    }

    /// Registers a resource.
    pub fn with_resource(mut self, resource: impl Into<String>, mode: WriteMode) -> Self {
        self.resources.insert(resource.into(), mode);
        self
    }

    /// Registers the resource of a settings domain.
    pub fn with_domain(self, domain: SettingsDomain) -> Self {
        self.with_resource(domain.resource(), domain.write_mode())
    }

    /// Sets the maximum request body size.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Sets the document a first PATCH to `resource` is applied to.
    pub fn with_default(mut self, resource: impl Into<String>, document: Value) -> Self {
        self.defaults.insert(resource.into(), document);
        self
    }

    /// Returns the write method `resource` accepts, if it is known.
    pub fn write_mode(&self, resource: &str) -> Option<WriteMode> {
        self.resources.get(resource).copied()
    }
}

impl Default for ServerConfig {
    /// Serves every settings domain.
    fn default() -> Self {
        SettingsDomain::ALL
            .iter()
            .fold(Self::new(), |config, domain| config.with_domain(*domain))
    }
}
