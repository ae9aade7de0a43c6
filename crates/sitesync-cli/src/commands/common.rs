use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sitesync_core::models::SyncConflict;
use sitesync_core::sync::{HttpSyncTransport, SyncTransport};
use sitesync_core::{Entity, EntityKind, LocalStore, NetworkMonitor, SyncConfig, SyncEngine};

use crate::error::CliError;

/// Everything a sync-capable command needs
pub struct SyncContext {
    pub engine: SyncEngine,
    pub transport: Arc<dyn SyncTransport>,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SITESYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sitesync")
        .join("sitesync.db")
}

pub async fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(LocalStore::open_path(path.to_path_buf()).await?)
}

/// Env-derived sync settings with the `--server-url` flag taking precedence.
pub fn sync_config(server_url: Option<String>) -> Result<SyncConfig, CliError> {
    let config = SyncConfig::from_env()?;
    Ok(match server_url {
        Some(url) => config.with_server_url(url.trim().trim_end_matches('/')),
        None => config,
    })
}

/// Build an engine over HTTP; the network starts in whatever state a ping reports.
pub async fn connect(store: LocalStore, config: SyncConfig) -> Result<SyncContext, CliError> {
    let Some(server_url) = config.server_url.clone() else {
        return Err(CliError::SyncNotConfigured);
    };
    let client_id = store.client_id().await?;
    let transport: Arc<dyn SyncTransport> = Arc::new(
        HttpSyncTransport::new(server_url, config.request_timeout)?.with_client_id(client_id),
    );

    let online = match transport.ping().await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!("Sync server unreachable: {error}");
            false
        }
    };
    let network = NetworkMonitor::new(online, config.reconnect_debounce);
    let engine = SyncEngine::new(store, Arc::clone(&transport), network, config);
    Ok(SyncContext { engine, transport })
}

pub fn parse_kind(kind: &str) -> Result<EntityKind, CliError> {
    Ok(kind.parse::<EntityKind>()?)
}

/// Combine `--json` and `key=value` arguments into one field map.
pub fn parse_fields(pairs: &[String], json: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let mut fields = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(CliError::InvalidJsonFields),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CliError::InvalidField(pair.clone()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidField(pair.clone()));
        }
        fields.insert(key.to_string(), parse_field_value(value));
    }

    if fields.is_empty() {
        return Err(CliError::EmptyFields);
    }
    Ok(fields)
}

/// Numbers, booleans and null keep their JSON type; anything else is a string.
pub fn parse_field_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => value,
        _ => Value::String(trimmed.to_string()),
    }
}

pub fn format_entity_lines(entities: &[Entity], now: DateTime<Utc>) -> Vec<String> {
    entities
        .iter()
        .map(|entity| {
            let id = entity.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let preview = entity_preview(entity, 40);
            let relative_time = format_relative_time(entity.last_modified, now);
            format!(
                "{short_id:<13}  {preview:<40}  {:<8}  {relative_time}",
                entity.sync_status.as_str()
            )
        })
        .collect()
}

/// One-line summary: the first of `name`, `title`, `description`, else the field count.
pub fn entity_preview(entity: &Entity, max_chars: usize) -> String {
    let label = ["name", "title", "description"]
        .iter()
        .find_map(|key| entity.data.get(*key).and_then(Value::as_str))
        .map(|value| value.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_else(|| format!("({} fields)", entity.data.len()));

    if label.chars().count() <= max_chars {
        label
    } else {
        let mut truncated = label
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let state = conflict
                .resolution
                .map_or("open", |resolution| resolution.as_str());
            let server = conflict
                .server_data
                .as_ref()
                .map_or_else(|| "deleted".to_string(), |record| format!("v{}", record.version));
            format!(
                "#{:<5} {}  {:<6}  {}/{}  server={}",
                conflict.id,
                format_timestamp(conflict.timestamp),
                state,
                conflict.entity,
                conflict.entity_id,
                server
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = (now - timestamp).num_milliseconds().max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
