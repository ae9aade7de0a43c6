//! Conflict log repository implementation

use chrono::{DateTime, Utc};
use libsql::{Connection, Value};

use crate::error::{Error, Result};
use crate::models::{Entity, EntityId, EntityKind, Resolution, SyncConflict};
use crate::sync::protocol::ServerRecord;
use crate::util::from_millis;

use super::{opt_int, opt_text};

const CONFLICT_COLUMNS: &str =
    "id, entity, entity_id, local_data, server_data, timestamp, resolved, resolution, resolved_at, server_version";

/// Trait for conflict log operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Record a conflict, or refresh the server side of the open one for the
    /// same record. `server_version` falls back to the record's version.
    /// Returns the conflict id.
    async fn record(
        &self,
        kind: EntityKind,
        id: &EntityId,
        local: Option<&Entity>,
        server: Option<&ServerRecord>,
        server_version: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Get a conflict by id
    async fn get(&self, id: i64) -> Result<Option<SyncConflict>>;

    /// Open conflict for a record, if any
    async fn open_for(&self, kind: EntityKind, id: &EntityId) -> Result<Option<SyncConflict>>;

    /// Conflicts, newest first; resolved ones only when asked
    async fn list(&self, include_resolved: bool) -> Result<Vec<SyncConflict>>;

    /// Mark a conflict as settled
    async fn mark_resolved(&self, id: i64, resolution: Resolution, at: DateTime<Utc>)
        -> Result<()>;

    /// Delete resolved conflicts settled before `cutoff`
    async fn prune_resolved(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Number of unresolved conflicts
    async fn count_open(&self) -> Result<usize>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Follow a reconciled id
    pub async fn rekey(&self, kind: EntityKind, old: &EntityId, new: &EntityId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_conflicts SET entity_id = ?1 WHERE entity = ?2 AND entity_id = ?3",
                [new.as_str(), kind.as_str(), old.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn select_one(
        &self,
        clause: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<SyncConflict>> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {clause}");
        let mut rows = self.conn.query(&sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_conflict(&row)?)),
            None => Ok(None),
        }
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn record(
        &self,
        kind: EntityKind,
        id: &EntityId,
        local: Option<&Entity>,
        server: Option<&ServerRecord>,
        server_version: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let local_data = json_or_null(local)?;
        let server_data = json_or_null(server)?;
        let server_version = server_version
            .or_else(|| server.map(|record| record.version))
            .map_or(Value::Null, Value::Integer);

        if let Some(existing) = self.open_for(kind, id).await? {
            self.conn
                .execute(
                    "UPDATE sync_conflicts SET server_data = ?1, local_data = COALESCE(?2, local_data),
                            server_version = ?3
                     WHERE id = ?4",
                    libsql::params![server_data, local_data, server_version, existing.id],
                )
                .await?;
            return Ok(existing.id);
        }

        self.conn
            .execute(
                "INSERT INTO sync_conflicts
                    (entity, entity_id, local_data, server_data, server_version, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                libsql::params![
                    kind.as_str(),
                    id.as_str(),
                    local_data,
                    server_data,
                    server_version,
                    at.timestamp_millis(),
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        self.select_one("WHERE id = ?1", [id]).await
    }

    async fn open_for(&self, kind: EntityKind, id: &EntityId) -> Result<Option<SyncConflict>> {
        self.select_one(
            "WHERE entity = ?1 AND entity_id = ?2 AND resolved = 0",
            [kind.as_str(), id.as_str()],
        )
        .await
    }

    async fn list(&self, include_resolved: bool) -> Result<Vec<SyncConflict>> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE resolved = 0"
        };
        let sql =
            format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter} ORDER BY timestamp DESC, id DESC");
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn mark_resolved(
        &self,
        id: i64,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET resolved = 1, resolution = ?1, resolved_at = ?2
                 WHERE id = ?3 AND resolved = 0",
                libsql::params![resolution.as_str(), at.timestamp_millis(), id],
            )
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!("open conflict {id}")));
        }
        Ok(())
    }

    async fn prune_resolved(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM sync_conflicts WHERE resolved = 1 AND resolved_at < ?1",
                [cutoff.timestamp_millis()],
            )
            .await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    async fn count_open(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_conflicts WHERE resolved = 0", ())
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn json_or_null<T: serde::Serialize>(value: Option<&T>) -> Result<Value> {
    match value {
        Some(value) => Ok(Value::Text(serde_json::to_string(value)?)),
        None => Ok(Value::Null),
    }
}

/// Parse a conflict from a row selected with `CONFLICT_COLUMNS`
fn parse_conflict(row: &libsql::Row) -> Result<SyncConflict> {
    let entity: String = row.get(1)?;
    let entity_id: String = row.get(2)?;
    let local_data = opt_text(row, 3)?
        .map(|text| serde_json::from_str(&text))
        .transpose()?;
    let server_data = opt_text(row, 4)?
        .map(|text| serde_json::from_str(&text))
        .transpose()?;
    let resolved: i64 = row.get(6)?;

    Ok(SyncConflict {
        id: row.get(0)?,
        entity: entity.parse()?,
        entity_id: EntityId::from(entity_id),
        local_data,
        server_data,
        server_version: opt_int(row, 9)?,
        timestamp: from_millis(row.get(5)?),
        resolved: resolved != 0,
        resolution: opt_text(row, 7)?.map(|text| text.parse()).transpose()?,
        resolved_at: opt_int(row, 8)?.map(from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::SyncStatus;
    use crate::util::now;
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn server(id: &str, version: i64) -> ServerRecord {
        ServerRecord {
            id: EntityId::from(id),
            version,
            created_at: now(),
            last_modified: now(),
            fields: json!({"name": "server"}).as_object().unwrap().clone(),
        }
    }

    fn local(id: &str) -> Entity {
        Entity {
            id: EntityId::from(id),
            kind: EntityKind::Project,
            created_at: now(),
            last_modified: now(),
            sync_status: SyncStatus::Conflict,
            remote_version: Some(1),
            data: json!({"name": "local"}).as_object().unwrap().clone(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeat_detection_refreshes_single_record() {
        let db = setup().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        let id = EntityId::from("p-1");

        let first = repo
            .record(EntityKind::Project, &id, Some(&local("p-1")), Some(&server("p-1", 2)), None, now())
            .await
            .unwrap();
        let second = repo
            .record(EntityKind::Project, &id, None, Some(&server("p-1", 3)), None, now())
            .await
            .unwrap();
        assert_eq!(first, second);

        let open = repo.list(false).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].server_data.as_ref().unwrap().version, 3);
        assert_eq!(open[0].server_version, Some(3));
        // Local side from the first detection survives.
        assert!(open[0].local_data.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_then_prune() {
        let db = setup().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        let id = EntityId::from("p-1");

        let conflict_id = repo
            .record(EntityKind::Project, &id, Some(&local("p-1")), None, Some(4), now())
            .await
            .unwrap();
        let resolved_at = now() - Duration::minutes(10);
        repo.mark_resolved(conflict_id, Resolution::Local, resolved_at)
            .await
            .unwrap();
        assert_eq!(repo.count_open().await.unwrap(), 0);

        let settled = repo.get(conflict_id).await.unwrap().unwrap();
        assert!(settled.resolved);
        // Remote deletion keeps the tombstone version.
        assert!(settled.server_data.is_none());
        assert_eq!(settled.server_version, Some(4));
        assert_eq!(settled.resolution, Some(Resolution::Local));
        assert_eq!(settled.resolved_at, Some(resolved_at));

        // Resolving twice is rejected.
        assert!(repo
            .mark_resolved(conflict_id, Resolution::Server, now())
            .await
            .is_err());

        let pruned = repo
            .prune_resolved(now() - Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(repo.get(conflict_id).await.unwrap().is_none());
    }
}
