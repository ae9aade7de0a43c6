//! Outbox (pending action) model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{EntityId, EntityKind};
use crate::error::Error;

/// Identifier of an outbox action; doubles as the wire operation id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Mutation recorded by an outbox action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// HTTP method of the equivalent REST call
    pub const fn method(self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown action type: {other}"))),
        }
    }
}

/// Delivery status of an outbox action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Failed,
    Completed,
}

impl ActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(Error::Database(format!("unknown action status: {other}"))),
        }
    }
}

/// A not-yet-acknowledged local mutation awaiting transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub entity: EntityKind,
    pub entity_id: EntityId,
    /// Full record fields for create/update; for delete `{"baseVersion": n}` or `null`
    pub data: Value,
    pub url: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OutboxAction {
    /// Build a pending action with the REST url/method for the mutation.
    pub fn new(
        action_type: ActionType,
        entity: EntityKind,
        entity_id: EntityId,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let url = match action_type {
            ActionType::Create => format!("/api/{}", entity.collection()),
            ActionType::Update | ActionType::Delete => {
                format!("/api/{}/{}", entity.collection(), entity_id)
            }
        };
        Self {
            id: ActionId::new(),
            action_type,
            entity,
            entity_id,
            data,
            url,
            method: action_type.method().to_string(),
            timestamp,
            retry_count: 0,
            status: ActionStatus::Pending,
            error: None,
        }
    }
}
