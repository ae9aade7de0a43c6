use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use sitesync_core::models::AppVersion;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// `None` keeps the authority in memory (local development only)
    pub db_path: Option<PathBuf>,
    /// Descriptor served on `GET /version`
    pub version: AppVersion,
    /// Mint server ids for creates instead of accepting client ids
    pub assigns_ids: bool,
    pub max_batch_operations: usize,
    pub rate_limit_window: Duration,
    pub batch_rate_limit_per_window: u32,
    pub changes_rate_limit_per_window: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "SITESYNC_API_BIND_ADDR", "127.0.0.1:8080");
        let db_path = optional_trimmed(&lookup, "SITESYNC_API_DB_PATH").map(PathBuf::from);

        let version = match optional_trimmed(&lookup, "SITESYNC_SERVER_VERSION") {
            Some(raw) => AppVersion::parse(&raw).ok_or_else(|| {
                ConfigError::Invalid(
                    "SITESYNC_SERVER_VERSION must look like major.minor.patch[+build]".to_string(),
                )
            })?,
            None => AppVersion::current(),
        };
        let mut version = version;
        if let Some(build) = optional_trimmed(&lookup, "SITESYNC_SERVER_BUILD") {
            version.build = build.parse::<u32>().map_err(|_| {
                ConfigError::Invalid("SITESYNC_SERVER_BUILD must be an integer".to_string())
            })?;
        }
        if let Some(features) = optional_trimmed(&lookup, "SITESYNC_SERVER_FEATURES") {
            version.features = split_list(&features);
        }
        if let Some(migrations) = optional_trimmed(&lookup, "SITESYNC_SERVER_MIGRATIONS") {
            version.migrations = split_list(&migrations);
        }

        let assigns_ids = parse_flag(&lookup, "SITESYNC_SERVER_ASSIGNS_IDS")?;

        let max_batch_operations = parse_bounded(
            &lookup,
            "SITESYNC_API_MAX_BATCH_OPERATIONS",
            500,
            1..=10_000,
        )?;
        let rate_limit_window_secs =
            parse_bounded(&lookup, "SITESYNC_API_RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let batch_rate_limit_per_window = parse_bounded(
            &lookup,
            "SITESYNC_API_BATCH_RATE_LIMIT_PER_WINDOW",
            120,
            1..=10_000,
        )?;
        let changes_rate_limit_per_window = parse_bounded(
            &lookup,
            "SITESYNC_API_CHANGES_RATE_LIMIT_PER_WINDOW",
            240,
            1..=10_000,
        )?;

        Ok(Self {
            bind_addr,
            db_path,
            version,
            assigns_ids,
            max_batch_operations,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            batch_rate_limit_per_window,
            changes_rate_limit_per_window,
        })
    }
}

fn parse_bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let message = || {
        format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        )
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(message()))?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid(message()))
    }
}

fn parse_flag(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<bool, ConfigError> {
    match optional_trimmed(lookup, name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
        },
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
