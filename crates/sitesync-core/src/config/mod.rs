//! Sync engine configuration.
//!
//! Hosts build a `SyncConfig` from defaults, override individual values with
//! the `with_*` builders, or read `SITESYNC_*` environment variables through
//! `SyncConfig::from_env`.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONFLICT_RETENTION_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;
const DEFAULT_RECONNECT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_MAX_ERRORS: usize = 50;

/// Tunables for the sync engine, network monitor and HTTP transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Remote base URL; `None` keeps the client offline-only
    pub server_url: Option<String>,
    /// Period of the background sync timer
    pub sync_interval: Duration,
    /// Outbox actions per pushed batch
    pub batch_size: usize,
    /// Transport attempts per batch before it is marked failed
    pub max_retries: u32,
    /// How long resolved conflicts are kept before pruning
    pub conflict_retention: Duration,
    /// Bound on every HTTP request
    pub request_timeout: Duration,
    /// First backoff delay; doubles on each retry
    pub retry_base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_retry_delay: Duration,
    /// Quiet period before the reconnection hook fires
    pub reconnect_debounce: Duration,
    /// Capacity of the sync error log
    pub max_errors: usize,
    /// Request a sync after every local mutation while online
    pub push_on_write: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            conflict_retention: Duration::from_secs(DEFAULT_CONFLICT_RETENTION_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
            reconnect_debounce: Duration::from_millis(DEFAULT_RECONNECT_DEBOUNCE_MS),
            max_errors: DEFAULT_MAX_ERRORS,
            push_on_write: true,
        }
    }
}

impl SyncConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Build a config from an arbitrary variable lookup; unset values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let server_url = optional_trimmed(&lookup, "SITESYNC_SERVER_URL")
            .map(|url| url.trim_end_matches('/').to_string());
        if let Some(url) = server_url.as_deref() {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "SITESYNC_SERVER_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let sync_interval_ms = parse_bounded(
            &lookup,
            "SITESYNC_SYNC_INTERVAL_MS",
            DEFAULT_SYNC_INTERVAL_MS,
            1_000..=86_400_000,
        )?;
        let batch_size = parse_bounded(
            &lookup,
            "SITESYNC_BATCH_SIZE",
            DEFAULT_BATCH_SIZE as u64,
            1..=1_000,
        )?;
        let max_retries = parse_bounded(
            &lookup,
            "SITESYNC_MAX_RETRIES",
            u64::from(DEFAULT_MAX_RETRIES),
            1..=20,
        )?;
        let retention_secs = parse_bounded(
            &lookup,
            "SITESYNC_CONFLICT_RETENTION_SECS",
            DEFAULT_CONFLICT_RETENTION_SECS,
            0..=2_592_000,
        )?;
        let timeout_secs = parse_bounded(
            &lookup,
            "SITESYNC_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1..=300,
        )?;
        let retry_base_ms = parse_bounded(
            &lookup,
            "SITESYNC_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            0..=60_000,
        )?;
        let debounce_ms = parse_bounded(
            &lookup,
            "SITESYNC_RECONNECT_DEBOUNCE_MS",
            DEFAULT_RECONNECT_DEBOUNCE_MS,
            0..=60_000,
        )?;
        let push_on_write = optional_trimmed(&lookup, "SITESYNC_PUSH_ON_WRITE")
            .map_or(defaults.push_on_write, |value| {
                matches!(
                    value.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            });

        Ok(Self {
            server_url,
            sync_interval: Duration::from_millis(sync_interval_ms),
            batch_size: usize::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            max_retries: u32::try_from(max_retries).unwrap_or(DEFAULT_MAX_RETRIES),
            conflict_retention: Duration::from_secs(retention_secs),
            request_timeout: Duration::from_secs(timeout_secs),
            retry_base_delay: Duration::from_millis(retry_base_ms),
            reconnect_debounce: Duration::from_millis(debounce_ms),
            push_on_write,
            ..defaults
        })
    }

    #[must_use]
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = normalize_text_option(Some(url.into()));
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_conflict_retention(mut self, retention: Duration) -> Self {
        self.conflict_retention = retention;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_reconnect_debounce(mut self, debounce: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self
    }

    #[must_use]
    pub const fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    #[must_use]
    pub const fn with_push_on_write(mut self, enabled: bool) -> Self {
        self.push_on_write = enabled;
        self
    }
}

fn parse_bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        Error::Config(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(Error::Config(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
