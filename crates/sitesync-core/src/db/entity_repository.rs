//! Entity repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{index_value, Entity, EntityFilter, EntityId, EntityKind, IndexField, SyncStatus};
use crate::util::from_millis;
use libsql::params::Params;
use libsql::{Connection, Rows, Value};
use serde_json::{Map, Value as Json};

use super::{opt_int, text_or_null};

const ENTITY_COLUMNS: &str =
    "kind, id, data, created_at, last_modified, sync_status, remote_version";

/// Trait for entity storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Get an entity by kind and id
    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>>;

    /// Insert or fully replace an entity row, refreshing its index columns
    async fn put(&self, entity: &Entity) -> Result<()>;

    /// Remove an entity; returns whether a row existed
    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool>;

    /// Open a cursor over the entities matching `filter`
    async fn query(&self, kind: EntityKind, filter: &EntityFilter) -> Result<EntityCursor>;

    /// Number of stored entities of a kind
    async fn count(&self, kind: EntityKind) -> Result<usize>;

    /// Set only the sync status and adopted server version
    async fn mark(
        &self,
        kind: EntityKind,
        id: &EntityId,
        status: SyncStatus,
        remote_version: Option<i64>,
    ) -> Result<()>;
}

/// Lazily-evaluated stream of entities produced by a query
pub struct EntityCursor {
    rows: Rows,
}

impl EntityCursor {
    /// Fetch the next matching entity, `None` when exhausted
    pub async fn next(&mut self) -> Result<Option<Entity>> {
        match self.rows.next().await? {
            Some(row) => parse_entity(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the remaining rows
    pub async fn collect(mut self) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        while let Some(entity) = self.next().await? {
            entities.push(entity);
        }
        Ok(entities)
    }
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Every entity of a kind, in insertion order
    pub async fn all(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.query(kind, &EntityFilter::new()).await?.collect().await
    }

    /// Replace every occurrence of `old` with `new` in foreign-key style fields
    /// (`...Id` / `..._id`) of all stored entities; returns rows touched.
    pub async fn rewrite_references(&self, old: &EntityId, new: &EntityId) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, id, data FROM entities WHERE instr(data, ?1) > 0",
                [old.as_str()],
            )
            .await?;

        let mut touched = Vec::new();
        while let Some(row) = rows.next().await? {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            let data: String = row.get(2)?;
            let mut map: Map<String, Json> = serde_json::from_str(&data)?;
            if rewrite_foreign_keys(&mut map, old, new) {
                touched.push((kind, id, map));
            }
        }

        for (kind, id, map) in &touched {
            let kind: EntityKind = kind.parse()?;
            let data = serde_json::to_string(map)?;
            let company = index_for(kind, map, IndexField::Company);
            let project = index_for(kind, map, IndexField::Project);
            let status = index_for(kind, map, IndexField::Status);
            self.conn
                .execute(
                    "UPDATE entities
                     SET data = ?1, company_id = ?2, project_id = ?3, status = ?4
                     WHERE kind = ?5 AND id = ?6",
                    libsql::params![data, company, project, status, kind.as_str(), id.as_str()],
                )
                .await?;
        }

        Ok(touched.len())
    }

    /// Move an entity to a new primary key
    pub async fn rekey(&self, kind: EntityKind, old: &EntityId, new: &EntityId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET id = ?1 WHERE kind = ?2 AND id = ?3",
                [new.as_str(), kind.as_str(), old.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Recompute index columns for every stored entity from its data
    pub async fn reindex(&self) -> Result<usize> {
        let mut count = 0;
        for kind in EntityKind::ALL {
            for entity in self.all(kind).await? {
                self.put(&entity).await?;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND id = ?2");
        let mut rows = self
            .conn
            .query(&sql, [kind.as_str(), id.as_str()])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(parse_entity(&row)?))
        } else {
            Ok(None)
        }
    }

    async fn put(&self, entity: &Entity) -> Result<()> {
        let data = serde_json::to_string(&entity.data)?;
        let company = index_for(entity.kind, &entity.data, IndexField::Company);
        let project = index_for(entity.kind, &entity.data, IndexField::Project);
        let status = index_for(entity.kind, &entity.data, IndexField::Status);
        let remote_version = entity.remote_version.map_or(Value::Null, Value::Integer);

        self.conn
            .execute(
                "INSERT INTO entities (
                    kind, id, data, company_id, project_id, status,
                    created_at, last_modified, sync_status, remote_version
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    data = excluded.data,
                    company_id = excluded.company_id,
                    project_id = excluded.project_id,
                    status = excluded.status,
                    created_at = excluded.created_at,
                    last_modified = excluded.last_modified,
                    sync_status = excluded.sync_status,
                    remote_version = excluded.remote_version",
                libsql::params![
                    entity.kind.as_str(),
                    entity.id.as_str(),
                    data,
                    company,
                    project,
                    status,
                    entity.created_at.timestamp_millis(),
                    entity.last_modified.timestamp_millis(),
                    entity.sync_status.as_str(),
                    remote_version,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                [kind.as_str(), id.as_str()],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn query(&self, kind: EntityKind, filter: &EntityFilter) -> Result<EntityCursor> {
        let mut sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1");
        let mut values = vec![Value::Text(kind.as_str().to_string())];

        for (field, value) in filter.index_constraints() {
            if !kind.is_indexed(field) {
                return Err(Error::InvalidInput(format!(
                    "{kind} records are not indexed by {}",
                    field.data_key()
                )));
            }
            values.push(Value::Text(value.to_string()));
            sql.push_str(&format!(" AND {} = ?{}", field.column(), values.len()));
        }

        if let Some(sync_status) = filter.sync_status {
            values.push(Value::Text(sync_status.as_str().to_string()));
            sql.push_str(&format!(" AND sync_status = ?{}", values.len()));
        }

        sql.push_str(" ORDER BY created_at, id");

        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let rows = self.conn.query(&sql, Params::Positional(values)).await?;
        Ok(EntityCursor { rows })
    }

    async fn count(&self, kind: EntityKind) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM entities WHERE kind = ?1", [kind.as_str()])
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn mark(
        &self,
        kind: EntityKind,
        id: &EntityId,
        status: SyncStatus,
        remote_version: Option<i64>,
    ) -> Result<()> {
        let remote_version = remote_version.map_or(Value::Null, Value::Integer);
        self.conn
            .execute(
                "UPDATE entities
                 SET sync_status = ?1, remote_version = COALESCE(?2, remote_version)
                 WHERE kind = ?3 AND id = ?4",
                libsql::params![status.as_str(), remote_version, kind.as_str(), id.as_str()],
            )
            .await?;
        Ok(())
    }
}

/// Index column value, only for fields the kind actually indexes
fn index_for(kind: EntityKind, data: &Map<String, Json>, field: IndexField) -> Value {
    if kind.is_indexed(field) {
        text_or_null(index_value(data, field))
    } else {
        Value::Null
    }
}

/// Whether a data key names a reference to another record
pub fn is_foreign_key(key: &str) -> bool {
    key != "id" && (key.ends_with("Id") || key.ends_with("_id"))
}

/// Rewrite foreign-key fields equal to `old`; returns whether anything changed
pub fn rewrite_foreign_keys(data: &mut Map<String, Json>, old: &EntityId, new: &EntityId) -> bool {
    let mut changed = false;
    for (key, value) in data.iter_mut() {
        if is_foreign_key(key) && value.as_str() == Some(old.as_str()) {
            *value = Json::String(new.to_string());
            changed = true;
        }
    }
    changed
}

/// Parse an entity from a row selected with `ENTITY_COLUMNS`
fn parse_entity(row: &libsql::Row) -> Result<Entity> {
    let kind: String = row.get(0)?;
    let id: String = row.get(1)?;
    let data: String = row.get(2)?;
    let sync_status: String = row.get(5)?;

    Ok(Entity {
        id: EntityId::from(id),
        kind: kind.parse()?,
        created_at: from_millis(row.get(3)?),
        last_modified: from_millis(row.get(4)?),
        sync_status: sync_status.parse()?,
        remote_version: opt_int(row, 6)?,
        data: serde_json::from_str(&data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::util::now;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn entity(kind: EntityKind, id: &str, data: Json) -> Entity {
        let stamp = now();
        Entity {
            id: EntityId::from(id),
            kind,
            created_at: stamp,
            last_modified: stamp,
            sync_status: SyncStatus::Pending,
            remote_version: None,
            data: data.as_object().unwrap().clone(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_and_get() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let stored = entity(EntityKind::Project, "p-1", json!({"name": "Bridge", "companyId": "c-1"}));
        repo.put(&stored).await.unwrap();

        let loaded = repo.get(EntityKind::Project, &stored.id).await.unwrap();
        assert_eq!(loaded, Some(stored));
        assert!(repo
            .get(EntityKind::User, &EntityId::from("p-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_by_index_and_limit() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        for (id, company, status) in [
            ("p-1", "c-1", "active"),
            ("p-2", "c-1", "closed"),
            ("p-3", "c-2", "active"),
        ] {
            let record = entity(
                EntityKind::Project,
                id,
                json!({"companyId": company, "status": status}),
            );
            repo.put(&record).await.unwrap();
        }

        let filter = EntityFilter::new().company("c-1");
        let ids: Vec<_> = repo
            .query(EntityKind::Project, &filter)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["p-1", "p-2"]);

        let filter = EntityFilter::new().status("active").limit(1);
        let limited = repo
            .query(EntityKind::Project, &filter)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_rejects_unindexed_field() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let filter = EntityFilter::new().project("p-1");
        let result = repo.query(EntityKind::User, &filter).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_reports_presence() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        let record = entity(EntityKind::Warehouse, "w-1", json!({}));
        repo.put(&record).await.unwrap();

        assert!(repo.delete(EntityKind::Warehouse, &record.id).await.unwrap());
        assert!(!repo.delete(EntityKind::Warehouse, &record.id).await.unwrap());
        assert_eq!(repo.count(EntityKind::Warehouse).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rewrite_references_updates_index_columns() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let tx = entity(
            EntityKind::Transaction,
            "t-1",
            json!({"projectId": "local-p", "memo": "local-p"}),
        );
        repo.put(&tx).await.unwrap();

        let touched = repo
            .rewrite_references(&EntityId::from("local-p"), &EntityId::from("srv-p"))
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let loaded = repo
            .get(EntityKind::Transaction, &tx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data["projectId"], "srv-p");
        // Plain fields are left alone.
        assert_eq!(loaded.data["memo"], "local-p");

        let filter = EntityFilter::new().project("srv-p");
        let found = repo
            .query(EntityKind::Transaction, &filter)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_foreign_key_detection() {
        assert!(is_foreign_key("projectId"));
        assert!(is_foreign_key("company_id"));
        assert!(!is_foreign_key("id"));
        assert!(!is_foreign_key("identity"));
    }
}
