//! Configuration for registrar components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `REGISTRAR_LEASES__LOCK_TTL_SECS=90`
pub const ENV_PREFIX: &str = "REGISTRAR";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// Coordination store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Entry lifetimes
    #[serde(default)]
    pub leases: LeaseConfig,

    /// Change-feed tuning
    #[serde(default)]
    pub feed: FeedConfig,

    /// Suffix appended to qualified names to form domain names
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_domain_suffix() -> String {
    "container".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            leases: LeaseConfig::default(),
            feed: FeedConfig::default(),
            domain_suffix: default_domain_suffix(),
            log_level: default_log_level(),
        }
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints, tried in order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Key prefix under which instances live
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Deadline for list / create / set calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_prefix() -> String {
    "instances".to_string()
}
fn default_request_timeout() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            prefix: default_prefix(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Lease configuration. A live instance must be refreshed more often than a
/// slot lock lives, so `update_ttl_secs < lock_ttl_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// TTL of a live instance entry
    #[serde(default = "default_update_ttl")]
    pub update_ttl_secs: u64,

    /// TTL of a slot lock placeholder
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_update_ttl() -> u64 {
    20
}
fn default_lock_ttl() -> u64 {
    60
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            update_ttl_secs: default_update_ttl(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl LeaseConfig {
    pub fn update_ttl(&self) -> Duration {
        Duration::from_secs(self.update_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Change-feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Deadline of a single long-poll watch call
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,

    /// First retry delay after a transport failure
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// Listing attempts before the feed gives up at startup
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: usize,

    /// Capacity of the update channel between reader and registry
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,

    /// Capacity of the error-report channel
    #[serde(default = "default_error_buffer")]
    pub error_buffer: usize,
}

fn default_watch_timeout() -> u64 {
    60
}
fn default_retry_initial() -> u64 {
    100
}
fn default_retry_max() -> u64 {
    5_000
}
fn default_bootstrap_attempts() -> usize {
    5
}
fn default_update_buffer() -> usize {
    10
}
fn default_error_buffer() -> usize {
    64
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            watch_timeout_secs: default_watch_timeout(),
            retry_initial_ms: default_retry_initial(),
            retry_max_ms: default_retry_max(),
            bootstrap_attempts: default_bootstrap_attempts(),
            update_buffer: default_update_buffer(),
            error_buffer: default_error_buffer(),
        }
    }
}

impl FeedConfig {
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl RegistrarConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Values missing from both fall back to the built-in defaults.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.endpoints")
                .try_parsing(true),
        );

        let config: RegistrarConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the feed or the slot lock cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "at least one store endpoint is required".into(),
            ));
        }
        if self.store.prefix.trim_matches('/').is_empty() {
            return Err(crate::Error::InvalidConfig(
                "store prefix cannot be empty".into(),
            ));
        }
        if self.leases.update_ttl_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "update TTL must be positive".into(),
            ));
        }
        if self.leases.update_ttl_secs >= self.leases.lock_ttl_secs {
            return Err(crate::Error::InvalidConfig(format!(
                "update TTL ({}s) must be shorter than lock TTL ({}s)",
                self.leases.update_ttl_secs, self.leases.lock_ttl_secs
            )));
        }
        if self.feed.update_buffer == 0 || self.feed.error_buffer == 0 {
            return Err(crate::Error::InvalidConfig(
                "channel buffers must be positive".into(),
            ));
        }
        if self.feed.bootstrap_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "bootstrap_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
