//! Configuration for the settings sync engine and its HTTP transport.

use crate::domain::{SettingsDomain, WriteMode};
use crate::path::PathAliases;
use serde_json::Value;
use std::time::Duration;

/// Quiet period observed by the settings forms before saving.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

/// How long a "failed to save" message stays visible.
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(5);

/// Configuration for one settings engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Domain name, used in logs.
    pub domain: String,
    /// Quiet period after the last edit before a save is sent.
    pub debounce: Duration,
    /// How long [`last_error`](crate::SyncEngine::last_error) reports a failure.
    pub error_display_ttl: Duration,
    /// Capacity of the save-failure broadcast channel.
    pub error_channel_capacity: usize,
    /// Flat key to nested path table.
    pub aliases: PathAliases,
    /// Document published when the server has none yet (404).
    pub default_document: Option<Value>,
}

impl EngineConfig {
    /// Creates a configuration with default timings.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            debounce: DEFAULT_DEBOUNCE,
            error_display_ttl: DEFAULT_ERROR_TTL,
            error_channel_capacity: 16,
            aliases: PathAliases::new(),
            default_document: None,
        }
    }

    /// Creates the configuration for a known settings domain.
    pub fn for_domain(domain: SettingsDomain) -> Self {
        Self::new(domain.name()).with_aliases(domain.aliases())
    }

    /// Sets the debounce interval.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets how long save failures stay reported.
    pub fn with_error_display_ttl(mut self, ttl: Duration) -> Self {
        self.error_display_ttl = ttl;
        self
    }

    /// Sets the error channel capacity.
    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity.max(1);
        self
    }

    /// Sets the flat key alias table.
    pub fn with_aliases(mut self, aliases: PathAliases) -> Self {
        self.aliases = aliases;
        self
    }

    /// Sets the document used when the server has none.
    pub fn with_default_document(mut self, document: Value) -> Self {
        self.default_document = Some(document);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("settings")
    }
}

/// Configuration for the HTTP settings transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the settings API (e.g. "https://shop.example.com").
    pub base_url: String,
    /// Resource path of the settings document (e.g. "/api/settings/business").
    pub resource: String,
    /// Whether saves send a partial patch or the whole document.
    pub write_mode: WriteMode,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl HttpTransportConfig {
    /// Creates a configuration for an arbitrary resource.
    pub fn new(base_url: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            resource: resource.into(),
            write_mode: WriteMode::Patch,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Creates a configuration for a known settings domain.
    pub fn for_domain(base_url: impl Into<String>, domain: SettingsDomain) -> Self {
        Self::new(base_url, domain.resource()).with_write_mode(domain.write_mode())
    }

    /// Sets the write mode.
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Full URL of the settings resource.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.resource.trim_start_matches('/')
        )
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            Duration::from_secs_f64(capped + capped * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
