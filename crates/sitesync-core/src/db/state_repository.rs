//! Key-value sync state, id map and applied data migrations

use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::error::Result;
use crate::models::{EntityId, EntityKind};
use crate::util::from_millis;

/// Keys used in the `sync_state` table
pub mod keys {
    pub const LAST_SYNC_TIME: &str = "last_sync_time";
    pub const PULL_CURSOR: &str = "pull_cursor";
    pub const CLIENT_ID: &str = "client_id";
    pub const APP_VERSION: &str = "app_version";
    pub const MIGRATION_BLOCKED: &str = "migration_blocked";
}

/// Trait for scalar sync state storage (async)
#[allow(async_fn_in_trait)]
pub trait StateRepository {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value
    async fn remove(&self, key: &str) -> Result<()>;
}

/// libSQL implementation of `StateRepository`
pub struct LibSqlStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Read a timestamp stored as Unix milliseconds
    pub async fn get_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .map(from_millis))
    }

    /// Store a timestamp as Unix milliseconds
    pub async fn set_time(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.set(key, &value.timestamp_millis().to_string()).await
    }

    /// Remember that a locally created id was replaced by the server's
    pub async fn map_id(
        &self,
        kind: EntityKind,
        local: &EntityId,
        server: &EntityId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO id_map (entity, local_id, server_id, mapped_at)
                 VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    kind.as_str(),
                    local.as_str(),
                    server.as_str(),
                    at.timestamp_millis(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Server id a local id was reconciled to
    pub async fn mapped_id(&self, kind: EntityKind, local: &EntityId) -> Result<Option<EntityId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT server_id FROM id_map WHERE entity = ?1 AND local_id = ?2",
                [kind.as_str(), local.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(EntityId::from(row.get::<String>(0)?))),
            None => Ok(None),
        }
    }

    /// Names of data migrations already run, in application order
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name FROM data_migrations ORDER BY applied_at, rowid",
                (),
            )
            .await?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            names.push(row.get::<String>(0)?);
        }
        Ok(names)
    }

    /// Record a data migration as applied
    pub async fn mark_migration(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO data_migrations (name, applied_at) VALUES (?1, ?2)",
                libsql::params![name, at.timestamp_millis()],
            )
            .await?;
        Ok(())
    }
}

impl StateRepository for LibSqlStateRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_state WHERE key = ?1", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
                [key, value],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?1", [key])
            .await?;
        Ok(())
    }
}
