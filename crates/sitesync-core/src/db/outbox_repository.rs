//! Outbox repository implementation

use crate::error::Result;
use crate::models::{ActionId, ActionStatus, EntityId, EntityKind, OutboxAction};
use crate::util::from_millis;
use libsql::{Connection, Value};
use serde_json::Value as Json;

use super::entity_repository::rewrite_foreign_keys;
use super::opt_text;

const OUTBOX_COLUMNS: &str =
    "id, action_type, entity, entity_id, data, url, method, timestamp, retry_count, status, error";

/// Trait for outbox storage operations (async)
#[allow(async_fn_in_trait)]
pub trait OutboxRepository {
    /// Persist a new action
    async fn insert(&self, action: &OutboxAction) -> Result<()>;

    /// Actions with the given status, oldest first
    async fn list(&self, status: Option<ActionStatus>) -> Result<Vec<OutboxAction>>;

    /// Pending actions in send order, skipping records with an open conflict
    async fn pushable(&self) -> Result<Vec<OutboxAction>>;

    /// Unfinished actions for one record, oldest first
    async fn for_entity(&self, kind: EntityKind, id: &EntityId) -> Result<Vec<OutboxAction>>;

    /// Remove an acknowledged action
    async fn remove(&self, id: &ActionId) -> Result<()>;

    /// Remove every action for a record; returns how many were removed
    async fn remove_for_entity(&self, kind: EntityKind, id: &EntityId) -> Result<usize>;

    /// Update status and error text of one action
    async fn set_status(
        &self,
        id: &ActionId,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Number of actions with the given status
    async fn count(&self, status: ActionStatus) -> Result<usize>;
}

/// libSQL implementation of `OutboxRepository`
pub struct LibSqlOutboxRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Bump the retry counter of one action; returns the new value
    pub async fn increment_retry(&self, id: &ActionId) -> Result<u32> {
        self.conn
            .execute(
                "UPDATE outbox SET retry_count = retry_count + 1 WHERE id = ?1",
                [id.as_str()],
            )
            .await?;
        let mut rows = self
            .conn
            .query("SELECT retry_count FROM outbox WHERE id = ?1", [id.as_str()])
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Put every failed action back in the queue with a fresh retry budget
    pub async fn reset_failed(&self) -> Result<usize> {
        let affected = self
            .conn
            .execute(
                "UPDATE outbox SET status = 'pending', retry_count = 0, error = NULL
                 WHERE status = 'failed'",
                (),
            )
            .await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    /// Return actions left in `syncing` (interrupted cycle) to `pending`
    pub async fn revert_syncing(&self) -> Result<usize> {
        let affected = self
            .conn
            .execute(
                "UPDATE outbox SET status = 'pending' WHERE status = 'syncing'",
                (),
            )
            .await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    /// Point queued actions at a reconciled id and rewrite references in payloads
    pub async fn rekey(&self, kind: EntityKind, old: &EntityId, new: &EntityId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE outbox SET entity_id = ?1, url = replace(url, ?2, ?1)
                 WHERE entity = ?3 AND entity_id = ?2",
                [new.as_str(), old.as_str(), kind.as_str()],
            )
            .await?;

        let mut rows = self
            .conn
            .query(
                "SELECT id, data FROM outbox WHERE instr(data, ?1) > 0",
                [old.as_str()],
            )
            .await?;

        let mut rewritten = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            let mut payload: Json = serde_json::from_str(&data)?;
            if let Some(map) = payload.as_object_mut() {
                if rewrite_foreign_keys(map, old, new) {
                    rewritten.push((id, serde_json::to_string(&payload)?));
                }
            }
        }

        for (id, data) in rewritten {
            self.conn
                .execute(
                    "UPDATE outbox SET data = ?1 WHERE id = ?2",
                    [data.as_str(), id.as_str()],
                )
                .await?;
        }
        Ok(())
    }

    async fn select(
        &self,
        clause: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<OutboxAction>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox {clause}");
        let mut rows = self.conn.query(&sql, params).await?;

        let mut actions = Vec::new();
        while let Some(row) = rows.next().await? {
            actions.push(parse_action(&row)?);
        }
        Ok(actions)
    }
}

impl OutboxRepository for LibSqlOutboxRepository<'_> {
    async fn insert(&self, action: &OutboxAction) -> Result<()> {
        let data = serde_json::to_string(&action.data)?;
        let error = action
            .error
            .as_ref()
            .map_or(Value::Null, |text| Value::Text(text.clone()));

        self.conn
            .execute(
                "INSERT INTO outbox (
                    id, action_type, entity, entity_id, data, url, method,
                    timestamp, retry_count, status, error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                libsql::params![
                    action.id.as_str(),
                    action.action_type.as_str(),
                    action.entity.as_str(),
                    action.entity_id.as_str(),
                    data,
                    action.url.as_str(),
                    action.method.as_str(),
                    action.timestamp.timestamp_millis(),
                    i64::from(action.retry_count),
                    action.status.as_str(),
                    error,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, status: Option<ActionStatus>) -> Result<Vec<OutboxAction>> {
        match status {
            Some(status) => {
                self.select(
                    "WHERE status = ?1 ORDER BY timestamp, rowid",
                    [status.as_str()],
                )
                .await
            }
            None => self.select("ORDER BY timestamp, rowid", ()).await,
        }
    }

    async fn pushable(&self) -> Result<Vec<OutboxAction>> {
        self.select(
            "WHERE status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM sync_conflicts c
                   WHERE c.resolved = 0
                     AND c.entity = outbox.entity
                     AND c.entity_id = outbox.entity_id
               )
             ORDER BY timestamp, rowid",
            (),
        )
        .await
    }

    async fn for_entity(&self, kind: EntityKind, id: &EntityId) -> Result<Vec<OutboxAction>> {
        self.select(
            "WHERE entity = ?1 AND entity_id = ?2 AND status != 'completed'
             ORDER BY timestamp, rowid",
            [kind.as_str(), id.as_str()],
        )
        .await
    }

    async fn remove(&self, id: &ActionId) -> Result<()> {
        self.conn
            .execute("DELETE FROM outbox WHERE id = ?1", [id.as_str()])
            .await?;
        Ok(())
    }

    async fn remove_for_entity(&self, kind: EntityKind, id: &EntityId) -> Result<usize> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM outbox WHERE entity = ?1 AND entity_id = ?2",
                [kind.as_str(), id.as_str()],
            )
            .await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    async fn set_status(
        &self,
        id: &ActionId,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.map_or(Value::Null, |text| Value::Text(text.to_string()));
        self.conn
            .execute(
                "UPDATE outbox SET status = ?1, error = ?2 WHERE id = ?3",
                libsql::params![status.as_str(), error, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn count(&self, status: ActionStatus) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM outbox WHERE status = ?1", [status.as_str()])
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Parse an action from a row selected with `OUTBOX_COLUMNS`
fn parse_action(row: &libsql::Row) -> Result<OutboxAction> {
    let id: String = row.get(0)?;
    let action_type: String = row.get(1)?;
    let entity: String = row.get(2)?;
    let entity_id: String = row.get(3)?;
    let data: String = row.get(4)?;
    let retry_count: i64 = row.get(8)?;
    let status: String = row.get(9)?;

    Ok(OutboxAction {
        id: ActionId::from(id),
        action_type: action_type.parse()?,
        entity: entity.parse()?,
        entity_id: EntityId::from(entity_id),
        data: serde_json::from_str(&data)?,
        url: row.get(5)?,
        method: row.get(6)?,
        timestamp: from_millis(row.get(7)?),
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        status: status.parse()?,
        error: opt_text(row, 10)?,
    })
}
