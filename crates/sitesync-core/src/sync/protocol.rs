//! Wire types for the batch-push / changes-pull protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{
    strip_reserved, ActionStatus, ActionType, Entity, EntityId, EntityKind, SyncStatus,
};

/// Canonical server view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: EntityId,
    /// Monotonic per-record version issued by the server
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ServerRecord {
    /// Local view of this record, marked synced at the server's version.
    pub fn to_entity(&self, kind: EntityKind) -> Entity {
        Entity {
            id: self.id.clone(),
            kind,
            created_at: self.created_at,
            last_modified: self.last_modified,
            sync_status: SyncStatus::Synced,
            remote_version: Some(self.version),
            data: strip_reserved(self.fields.clone()),
        }
    }
}

/// Urgency hint for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPriority {
    #[default]
    Normal,
    High,
}

/// One outbox action on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: ActionType,
    pub entity: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    pub data: Value,
    pub local_timestamp: DateTime<Utc>,
    /// Server version the client last adopted for this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    pub checksum: String,
}

/// `POST /sync/batch` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub id: String,
    /// Stable identifier of the pushing installation
    pub client_id: String,
    pub operations: Vec<BatchOperation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: BatchPriority,
    #[serde(default)]
    pub retry_count: u32,
    pub status: ActionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessfulOperation {
    pub operation_id: String,
    pub entity: EntityKind,
    pub entity_id: EntityId,
    /// Canonical record; `None` for deletes
    pub server_data: Option<ServerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedOperation {
    pub operation_id: String,
    pub entity: EntityKind,
    pub entity_id: EntityId,
    pub local_data: Value,
    /// Current server record; `None` when deleted remotely
    pub server_data: Option<ServerRecord>,
    /// Version of the server row, tombstones included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    pub operation_id: String,
    pub error: String,
}

/// `POST /sync/batch` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub successful: Vec<SuccessfulOperation>,
    #[serde(default)]
    pub conflicts: Vec<ConflictedOperation>,
    #[serde(default)]
    pub errors: Vec<FailedOperation>,
}

/// Kind of server-side change in the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One entry of `GET /sync/changes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity: EntityKind,
    pub entity_id: EntityId,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Record after the change; `None` for deletes
    pub data: Option<ServerRecord>,
    pub version: i64,
    pub changed_at: DateTime<Utc>,
}

/// SHA-256 over the canonical JSON encoding of an operation payload.
///
/// `serde_json::Map` is ordered by key, so equal payloads hash equally.
pub fn checksum(data: &Value) -> String {
    let encoded = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}
