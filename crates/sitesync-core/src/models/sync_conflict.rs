//! Sync conflict model

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityId, EntityKind};
use crate::error::Error;
use crate::sync::protocol::ServerRecord;

/// How a conflict was (or should be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local version and overwrite the server
    Local,
    /// Discard the local mutation and adopt the server version
    Server,
    /// Shallow field union, server wins on collisions
    Merge,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Server => "server",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            "merge" => Ok(Self::Merge),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution '{other}' (expected local, server or merge)"
            ))),
        }
    }
}

/// Recorded divergence between a local pending mutation and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity: EntityKind,
    pub entity_id: EntityId,
    /// Local record at detection time (`None` when deleted locally)
    pub local_data: Option<Entity>,
    /// Server record at detection time (`None` when deleted remotely)
    pub server_data: Option<ServerRecord>,
    /// Server row version, also known for a remote deletion
    #[serde(default)]
    pub server_version: Option<i64>,
    /// Detection timestamp
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
}
