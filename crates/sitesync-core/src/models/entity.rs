//! Entity model shared by every synchronized record kind

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;

/// Keys owned by the store; stripped from caller-provided data.
pub const RESERVED_KEYS: [&str; 5] = [
    "id",
    "createdAt",
    "lastModified",
    "syncStatus",
    "remoteVersion",
];

/// A unique identifier for an entity.
///
/// Locally created ids are UUID v7 (time-sortable); server-issued ids are
/// accepted verbatim, so the inner value is an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new locally unique id using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Domain record kinds that participate in synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Transaction,
    User,
    Equipment,
    Warehouse,
    Document,
    Company,
}

/// Secondary index columns the store can maintain for a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
    /// `companyId` field, stored in `company_id`
    Company,
    /// `projectId` field, stored in `project_id`
    Project,
    /// `status` field, stored in `status`
    Status,
}

impl IndexField {
    /// Data key the index value is read from
    pub const fn data_key(self) -> &'static str {
        match self {
            Self::Company => "companyId",
            Self::Project => "projectId",
            Self::Status => "status",
        }
    }

    /// Column holding the extracted value
    pub const fn column(self) -> &'static str {
        match self {
            Self::Company => "company_id",
            Self::Project => "project_id",
            Self::Status => "status",
        }
    }
}

impl EntityKind {
    pub const ALL: [Self; 7] = [
        Self::Project,
        Self::Transaction,
        Self::User,
        Self::Equipment,
        Self::Warehouse,
        Self::Document,
        Self::Company,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Transaction => "transaction",
            Self::User => "user",
            Self::Equipment => "equipment",
            Self::Warehouse => "warehouse",
            Self::Document => "document",
            Self::Company => "company",
        }
    }

    /// REST collection segment used for outbox URLs
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Transaction => "transactions",
            Self::User => "users",
            Self::Equipment => "equipment",
            Self::Warehouse => "warehouses",
            Self::Document => "documents",
            Self::Company => "companies",
        }
    }

    /// Index definitions per kind
    pub const fn indexed_fields(self) -> &'static [IndexField] {
        match self {
            Self::Project => &[IndexField::Company, IndexField::Status],
            Self::Transaction | Self::Equipment => {
                &[IndexField::Company, IndexField::Project, IndexField::Status]
            }
            Self::User | Self::Warehouse => &[IndexField::Company],
            Self::Document => &[IndexField::Company, IndexField::Project],
            Self::Company => &[IndexField::Status],
        }
    }

    pub fn is_indexed(self, field: IndexField) -> bool {
        self.indexed_fields().contains(&field)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized || kind.collection() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity kind: {s}")))
    }
}

/// Synchronization state of a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::Database(format!("unknown sync status: {other}"))),
        }
    }
}

/// A stored entity record with its synchronization metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub sync_status: SyncStatus,
    /// Last server version adopted for this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<i64>,
    /// Domain fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Entity {
    /// Read an index value from the domain fields.
    ///
    /// Strings are used verbatim, numbers and booleans are stringified.
    pub fn index_value(&self, field: IndexField) -> Option<String> {
        index_value(&self.data, field)
    }

    /// Domain fields as a JSON value (used for outbox payloads).
    pub fn data_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

/// Extract an index value from raw domain fields
pub fn index_value(data: &Map<String, Value>, field: IndexField) -> Option<String> {
    match data.get(field.data_key())? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Remove store-owned keys from caller data
pub fn strip_reserved(mut data: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_KEYS {
        data.remove(key);
    }
    data
}

/// Filter applied by `query`/`list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub company_id: Option<String>,
    pub project_id: Option<String>,
    pub status: Option<String>,
    pub sync_status: Option<SyncStatus>,
    pub limit: Option<usize>,
}

impl EntityFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    #[must_use]
    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub const fn sync_status(mut self, sync_status: SyncStatus) -> Self {
        self.sync_status = Some(sync_status);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Index constraints present in this filter
    pub fn index_constraints(&self) -> Vec<(IndexField, &str)> {
        let mut constraints = Vec::new();
        if let Some(value) = self.company_id.as_deref() {
            constraints.push((IndexField::Company, value));
        }
        if let Some(value) = self.project_id.as_deref() {
            constraints.push((IndexField::Project, value));
        }
        if let Some(value) = self.status.as_deref() {
            constraints.push((IndexField::Status, value));
        }
        constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
    }

    #[test]
    fn entity_id_rejects_blank() {
        assert!("  ".parse::<EntityId>().is_err());
        assert_eq!("abc".parse::<EntityId>().unwrap().as_str(), "abc");
    }

    #[test]
    fn kind_parses_singular_and_collection_names() {
        assert_eq!("project".parse::<EntityKind>().unwrap(), EntityKind::Project);
        assert_eq!("Projects".parse::<EntityKind>().unwrap(), EntityKind::Project);
        assert_eq!("companies".parse::<EntityKind>().unwrap(), EntityKind::Company);
        assert!("invoice".parse::<EntityKind>().is_err());
    }

    #[test]
    fn index_values_stringify_scalars() {
        let data = json!({"companyId": 7, "status": "active", "projectId": ""});
        let data = data.as_object().unwrap();
        assert_eq!(index_value(data, IndexField::Company).as_deref(), Some("7"));
        assert_eq!(index_value(data, IndexField::Status).as_deref(), Some("active"));
        assert_eq!(index_value(data, IndexField::Project), None);
    }

    #[test]
    fn strip_reserved_removes_store_keys() {
        let data = json!({"id": "x", "syncStatus": "synced", "name": "Depot"});
        let stripped = strip_reserved(data.as_object().unwrap().clone());
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("name"));
    }

    #[test]
    fn entity_serializes_flat_camel_case() {
        let entity = Entity {
            id: EntityId::from("p-1"),
            kind: EntityKind::Project,
            created_at: DateTime::default(),
            last_modified: DateTime::default(),
            sync_status: SyncStatus::Pending,
            remote_version: None,
            data: json!({"name": "Bridge"}).as_object().unwrap().clone(),
        };
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["name"], "Bridge");
        assert_eq!(value["syncStatus"], "pending");
        assert!(value.get("remoteVersion").is_none());
    }
}
