//! Server-side apply logic for batch pushes and the change feed.
//!
//! Hosted by the API server and usable in-process for tests. Each operation
//! is applied in its own transaction and remembered by operation id, so a
//! replayed batch has no further effect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Value};
use serde_json::{Map, Value as Json};
use tokio::sync::Mutex;

use crate::db::{is_foreign_key, transaction, Database, Schema};
use crate::error::Result;
use crate::models::{strip_reserved, ActionType, AppVersion, EntityId, EntityKind};
use crate::sync::protocol::{
    checksum, BatchOperation, BatchRequest, BatchResponse, ChangeType, ConflictedOperation,
    FailedOperation, RemoteChange, ServerRecord, SuccessfulOperation,
};
use crate::util::{from_millis, now};

/// Behaviour switches for the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// Descriptor served on `GET /version`
    pub version: AppVersion,
    /// Mint server ids for creates instead of accepting client ids
    pub assigns_ids: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            version: AppVersion::current(),
            assigns_ids: false,
        }
    }
}

/// Result of applying one operation
#[derive(Debug, Clone, PartialEq)]
enum Applied {
    Success(SuccessfulOperation),
    Conflict(ConflictedOperation),
    Failed(FailedOperation),
}

/// Stored server-side row
#[derive(Debug, Clone, PartialEq)]
struct StoredRecord {
    record: ServerRecord,
    deleted: bool,
    last_client_id: String,
}

/// Canonical record store shared by every client
#[derive(Clone)]
pub struct AuthorityStore {
    db: Arc<Mutex<Database>>,
    config: AuthorityConfig,
    db_path: Option<PathBuf>,
}

impl AuthorityStore {
    pub async fn open_path(db_path: impl Into<PathBuf>, config: AuthorityConfig) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open_with_schema(&db_path, Schema::Authority).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            config,
            db_path: Some(db_path),
        })
    }

    pub async fn open_in_memory(config: AuthorityConfig) -> Result<Self> {
        let db = Database::open_in_memory_with_schema(Schema::Authority).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            config,
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Descriptor served to clients
    pub fn version(&self) -> AppVersion {
        self.config.version.clone()
    }

    /// Apply every operation of a batch, each in its own transaction.
    pub async fn apply_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let mut response = BatchResponse::default();

        for operation in &batch.operations {
            let applied = transaction(
                conn,
                apply_operation(conn, &self.config, &batch.client_id, operation),
            )
            .await?;
            match applied {
                Applied::Success(success) => response.successful.push(success),
                Applied::Conflict(conflict) => {
                    tracing::info!(
                        operation_id = %conflict.operation_id,
                        entity = %conflict.entity,
                        entity_id = %conflict.entity_id,
                        reason = %conflict.reason,
                        "Operation conflicted"
                    );
                    response.conflicts.push(conflict);
                }
                Applied::Failed(failed) => {
                    tracing::warn!(
                        operation_id = %failed.operation_id,
                        error = %failed.error,
                        "Operation rejected"
                    );
                    response.errors.push(failed);
                }
            }
        }

        tracing::debug!(
            batch_id = %batch.id,
            client_id = %batch.client_id,
            successful = response.successful.len(),
            conflicts = response.conflicts.len(),
            errors = response.errors.len(),
            "Applied batch"
        );
        Ok(response)
    }

    /// Changes at or after `since` in feed order; `None` yields a snapshot
    /// with live records as creates and tombstones as deletes.
    pub async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        match since {
            Some(since) => change_feed(conn, since).await,
            None => snapshot(conn).await,
        }
    }

    /// Current canonical record, `None` when absent or deleted
    pub async fn record(&self, kind: EntityKind, id: &EntityId) -> Result<Option<ServerRecord>> {
        let db = self.db.lock().await;
        Ok(load(db.connection(), kind, id)
            .await?
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.record))
    }

    /// Number of live records of a kind
    pub async fn live_count(&self, kind: EntityKind) -> Result<usize> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT COUNT(*) FROM records WHERE kind = ?1 AND deleted = 0",
                [kind.as_str()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

async fn apply_operation(
    conn: &Connection,
    config: &AuthorityConfig,
    client_id: &str,
    op: &BatchOperation,
) -> Result<Applied> {
    if let Some(replayed) = replay(conn, &op.id).await? {
        return Ok(Applied::Success(replayed));
    }

    if checksum(&op.data) != op.checksum {
        return Ok(failed(op, "checksum mismatch"));
    }

    let applied = match op.op_type {
        ActionType::Create => apply_create(conn, config, client_id, op).await?,
        ActionType::Update => apply_update(conn, client_id, op).await?,
        ActionType::Delete => apply_delete(conn, client_id, op).await?,
    };

    if let Applied::Success(success) = &applied {
        conn.execute(
            "INSERT INTO applied_operations (operation_id, result, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                op.id.as_str(),
                serde_json::to_string(success)?,
                now().timestamp_millis(),
            ],
        )
        .await?;
    }
    Ok(applied)
}

async fn apply_create(
    conn: &Connection,
    config: &AuthorityConfig,
    client_id: &str,
    op: &BatchOperation,
) -> Result<Applied> {
    let Some(mut fields) = payload_fields(&op.data) else {
        return Ok(failed(op, "create payload must be a JSON object"));
    };
    resolve_references(conn, &mut fields).await?;
    let requested = match &op.entity_id {
        Some(id) => Some(resolve_alias(conn, op.entity, id).await?),
        None => None,
    };

    if let Some(id) = &requested {
        if let Some(existing) = load(conn, op.entity, id).await? {
            let change_type = if existing.deleted {
                if !revives(op, &existing) {
                    return Ok(conflict(op, id, existing, "record was deleted on the server"));
                }
                ChangeType::Create
            } else if existing.last_client_id != client_id {
                return Ok(conflict(op, id, existing, "record already exists"));
            } else {
                ChangeType::Update
            };
            let record = write(
                conn,
                op,
                id,
                fields,
                existing.record.version + 1,
                client_id,
                change_type,
                existing.record.created_at,
            )
            .await?;
            return Ok(success(op, id, Some(record)));
        }
    }

    let id = match (&requested, config.assigns_ids) {
        (Some(id), false) => id.clone(),
        (client, _) => {
            let minted = EntityId::new();
            if let Some(client) = client {
                conn.execute(
                    "INSERT OR REPLACE INTO id_aliases (kind, client_id, server_id) VALUES (?1, ?2, ?3)",
                    [op.entity.as_str(), client.as_str(), minted.as_str()],
                )
                .await?;
            }
            minted
        }
    };

    let record = write(conn, op, &id, fields, 1, client_id, ChangeType::Create, now()).await?;
    Ok(success(op, &id, Some(record)))
}

async fn apply_update(conn: &Connection, client_id: &str, op: &BatchOperation) -> Result<Applied> {
    let Some(requested) = &op.entity_id else {
        return Ok(failed(op, "update requires an entity id"));
    };
    let Some(mut fields) = payload_fields(&op.data) else {
        return Ok(failed(op, "update payload must be a JSON object"));
    };
    resolve_references(conn, &mut fields).await?;
    let id = resolve_alias(conn, op.entity, requested).await?;

    let Some(existing) = load(conn, op.entity, &id).await? else {
        return Ok(failed(op, &format!("{} {id} not found", op.entity)));
    };
    let change_type = if existing.deleted {
        if !revives(op, &existing) {
            return Ok(conflict(op, &id, existing, "record was deleted on the server"));
        }
        ChangeType::Create
    } else if is_stale(op, &existing, client_id) {
        return Ok(conflict(op, &id, existing, "record was modified by another client"));
    } else {
        ChangeType::Update
    };

    let record = write(
        conn,
        op,
        &id,
        fields,
        existing.record.version + 1,
        client_id,
        change_type,
        existing.record.created_at,
    )
    .await?;
    Ok(success(op, &id, Some(record)))
}

async fn apply_delete(conn: &Connection, client_id: &str, op: &BatchOperation) -> Result<Applied> {
    let Some(requested) = &op.entity_id else {
        return Ok(failed(op, "delete requires an entity id"));
    };
    let id = resolve_alias(conn, op.entity, requested).await?;

    let Some(existing) = load(conn, op.entity, &id).await? else {
        // Never reached the server; nothing to remove.
        return Ok(success(op, &id, None));
    };
    if existing.deleted {
        return Ok(conflict(op, &id, existing, "record was already deleted on the server"));
    }
    if is_stale(op, &existing, client_id) {
        return Ok(conflict(op, &id, existing, "record was modified by another client"));
    }

    let version = existing.record.version + 1;
    let changed_at = now();
    conn.execute(
        "UPDATE records SET deleted = 1, version = ?1, last_modified = ?2, last_client_id = ?3
         WHERE kind = ?4 AND id = ?5",
        libsql::params![
            version,
            op.local_timestamp.timestamp_millis(),
            client_id,
            op.entity.as_str(),
            id.as_str(),
        ],
    )
    .await?;
    log_change(conn, op.entity, &id, ChangeType::Delete, None, version, changed_at).await?;
    Ok(success(op, &id, None))
}

/// A tombstone is only overwritten by a writer that has seen the delete.
fn revives(op: &BatchOperation, tombstone: &StoredRecord) -> bool {
    op.base_version
        .is_some_and(|base| base >= tombstone.record.version)
}

/// Base version behind the server and last written by someone else
fn is_stale(op: &BatchOperation, existing: &StoredRecord, client_id: &str) -> bool {
    op.base_version.unwrap_or(0) < existing.record.version && existing.last_client_id != client_id
}

#[allow(clippy::too_many_arguments)]
async fn write(
    conn: &Connection,
    op: &BatchOperation,
    id: &EntityId,
    fields: Map<String, Json>,
    version: i64,
    client_id: &str,
    change_type: ChangeType,
    created_at: DateTime<Utc>,
) -> Result<ServerRecord> {
    let record = ServerRecord {
        id: id.clone(),
        version,
        created_at,
        last_modified: op.local_timestamp,
        fields,
    };
    conn.execute(
        "INSERT INTO records (kind, id, data, version, created_at, last_modified, deleted, last_client_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
         ON CONFLICT(kind, id) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            last_modified = excluded.last_modified,
            deleted = 0,
            last_client_id = excluded.last_client_id",
        libsql::params![
            op.entity.as_str(),
            id.as_str(),
            serde_json::to_string(&record.fields)?,
            version,
            created_at.timestamp_millis(),
            record.last_modified.timestamp_millis(),
            client_id,
        ],
    )
    .await?;
    log_change(conn, op.entity, id, change_type, Some(&record), version, now()).await?;
    Ok(record)
}

async fn log_change(
    conn: &Connection,
    kind: EntityKind,
    id: &EntityId,
    change_type: ChangeType,
    record: Option<&ServerRecord>,
    version: i64,
    changed_at: DateTime<Utc>,
) -> Result<()> {
    let data = match record {
        Some(record) => Value::Text(serde_json::to_string(record)?),
        None => Value::Null,
    };
    conn.execute(
        "INSERT INTO changes (kind, id, change_type, data, version, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        libsql::params![
            kind.as_str(),
            id.as_str(),
            change_type.as_str(),
            data,
            version,
            changed_at.timestamp_millis(),
        ],
    )
    .await?;
    Ok(())
}

async fn replay(conn: &Connection, operation_id: &str) -> Result<Option<SuccessfulOperation>> {
    let mut rows = conn
        .query(
            "SELECT result FROM applied_operations WHERE operation_id = ?1",
            [operation_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let stored: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&stored)?))
        }
        None => Ok(None),
    }
}

async fn resolve_alias(conn: &Connection, kind: EntityKind, id: &EntityId) -> Result<EntityId> {
    let mut rows = conn
        .query(
            "SELECT server_id FROM id_aliases WHERE kind = ?1 AND client_id = ?2",
            [kind.as_str(), id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(EntityId::from(row.get::<String>(0)?)),
        None => Ok(id.clone()),
    }
}

/// Point foreign-key fields holding a client id at the minted server id.
async fn resolve_references(conn: &Connection, fields: &mut Map<String, Json>) -> Result<()> {
    for (key, value) in fields.iter_mut() {
        if !is_foreign_key(key) {
            continue;
        }
        let Some(client_id) = value.as_str() else {
            continue;
        };
        let mut rows = conn
            .query(
                "SELECT server_id FROM id_aliases WHERE client_id = ?1 LIMIT 1",
                [client_id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            *value = Json::String(row.get::<String>(0)?);
        }
    }
    Ok(())
}

async fn load(conn: &Connection, kind: EntityKind, id: &EntityId) -> Result<Option<StoredRecord>> {
    let mut rows = conn
        .query(
            "SELECT id, data, version, created_at, last_modified, deleted, last_client_id
             FROM records WHERE kind = ?1 AND id = ?2",
            [kind.as_str(), id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_stored(&row)?)),
        None => Ok(None),
    }
}

fn parse_stored(row: &libsql::Row) -> Result<StoredRecord> {
    let id: String = row.get(0)?;
    let data: String = row.get(1)?;
    let deleted: i64 = row.get(5)?;
    Ok(StoredRecord {
        record: ServerRecord {
            id: EntityId::from(id),
            version: row.get(2)?,
            created_at: from_millis(row.get(3)?),
            last_modified: from_millis(row.get(4)?),
            fields: serde_json::from_str(&data)?,
        },
        deleted: deleted != 0,
        last_client_id: row.get(6)?,
    })
}

async fn change_feed(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<RemoteChange>> {
    let mut rows = conn
        .query(
            "SELECT kind, id, change_type, data, version, changed_at
             FROM changes WHERE changed_at >= ?1 ORDER BY seq",
            [since.timestamp_millis()],
        )
        .await?;

    let mut changes = Vec::new();
    while let Some(row) = rows.next().await? {
        let kind: String = row.get(0)?;
        let id: String = row.get(1)?;
        let change_type: String = row.get(2)?;
        let data = match row.get_value(3)? {
            Value::Text(text) => Some(serde_json::from_str::<ServerRecord>(&text)?),
            _ => None,
        };
        changes.push(RemoteChange {
            entity: kind.parse()?,
            entity_id: EntityId::from(id),
            change_type: parse_change_type(&change_type),
            data,
            version: row.get(4)?,
            changed_at: from_millis(row.get(5)?),
        });
    }
    Ok(changes)
}

async fn snapshot(conn: &Connection) -> Result<Vec<RemoteChange>> {
    let mut rows = conn
        .query(
            "SELECT r.kind, r.id, r.data, r.version, r.created_at, r.last_modified, r.deleted,
                    COALESCE((SELECT MAX(c.changed_at) FROM changes c
                              WHERE c.kind = r.kind AND c.id = r.id), r.last_modified)
             FROM records r ORDER BY r.created_at, r.id",
            (),
        )
        .await?;

    let mut changes = Vec::new();
    while let Some(row) = rows.next().await? {
        let kind: String = row.get(0)?;
        let entity_id = EntityId::from(row.get::<String>(1)?);
        let version: i64 = row.get(3)?;
        let deleted: i64 = row.get(6)?;
        let (change_type, data) = if deleted != 0 {
            (ChangeType::Delete, None)
        } else {
            let data: String = row.get(2)?;
            let record = ServerRecord {
                id: entity_id.clone(),
                version,
                created_at: from_millis(row.get(4)?),
                last_modified: from_millis(row.get(5)?),
                fields: serde_json::from_str(&data)?,
            };
            (ChangeType::Create, Some(record))
        };
        changes.push(RemoteChange {
            entity: kind.parse()?,
            entity_id,
            change_type,
            data,
            version,
            changed_at: from_millis(row.get(7)?),
        });
    }
    Ok(changes)
}

fn parse_change_type(value: &str) -> ChangeType {
    match value {
        "create" => ChangeType::Create,
        "delete" => ChangeType::Delete,
        _ => ChangeType::Update,
    }
}

fn payload_fields(data: &Json) -> Option<Map<String, Json>> {
    data.as_object().cloned().map(strip_reserved)
}

fn success(op: &BatchOperation, id: &EntityId, server_data: Option<ServerRecord>) -> Applied {
    Applied::Success(SuccessfulOperation {
        operation_id: op.id.clone(),
        entity: op.entity,
        entity_id: id.clone(),
        server_data,
    })
}

fn conflict(op: &BatchOperation, id: &EntityId, existing: StoredRecord, reason: &str) -> Applied {
    let server_version = existing.record.version;
    Applied::Conflict(ConflictedOperation {
        operation_id: op.id.clone(),
        entity: op.entity,
        entity_id: id.clone(),
        local_data: op.data.clone(),
        server_data: (!existing.deleted).then_some(existing.record),
        server_version: Some(server_version),
        reason: reason.to_string(),
    })
}

fn failed(op: &BatchOperation, error: &str) -> Applied {
    Applied::Failed(FailedOperation {
        operation_id: op.id.clone(),
        error: error.to_string(),
    })
}
