//! Version checks and named data migrations.

use std::sync::Arc;

use async_trait::async_trait;
use libsql::Connection;

use crate::db::{keys, LibSqlEntityRepository};
use crate::error::{Error, Result};
use crate::models::{AppVersion, VersionComparison};
use crate::services::LocalStore;
use crate::sync::SyncTransport;

/// Name of the built-in index rebuild migration
pub const REINDEX_ENTITIES: &str = "reindex-entities";

/// A named, idempotent transformation of local data.
///
/// `apply` runs inside a transaction opened by the store; it must only use
/// the given connection.
#[async_trait]
pub trait DataMigration: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, conn: &Connection) -> Result<()>;
}

/// Recomputes every entity's index columns from its data
pub struct ReindexEntities;

#[async_trait]
impl DataMigration for ReindexEntities {
    fn name(&self) -> &str {
        REINDEX_ENTITIES
    }

    async fn apply(&self, conn: &Connection) -> Result<()> {
        let count = LibSqlEntityRepository::new(conn).reindex().await?;
        tracing::info!(count, "Reindexed local entities");
        Ok(())
    }
}

/// Migrations this client knows how to run, by name
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Arc<dyn DataMigration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in migrations
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReindexEntities));
        registry
    }

    /// Add a migration; a later registration replaces one with the same name.
    pub fn register(&mut self, migration: Arc<dyn DataMigration>) {
        self.migrations.retain(|m| m.name() != migration.name());
        self.migrations.push(migration);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataMigration>> {
        self.migrations.iter().find(|m| m.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.migrations.iter().map(|m| m.name().to_string()).collect()
    }
}

/// Compares local and remote descriptors and runs pending migrations
#[derive(Clone)]
pub struct VersionManager {
    store: LocalStore,
    registry: MigrationRegistry,
}

impl VersionManager {
    pub const fn new(store: LocalStore, registry: MigrationRegistry) -> Self {
        Self { store, registry }
    }

    pub const fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Descriptor stored after the last update, or the compiled-in one.
    pub async fn get_current_version(&self) -> Result<AppVersion> {
        match self.store.state_value(keys::APP_VERSION).await? {
            Some(stored) => match serde_json::from_str::<AppVersion>(&stored) {
                Ok(version) => Ok(version),
                Err(error) => {
                    tracing::warn!("Ignoring unreadable stored app version: {error}");
                    Ok(AppVersion::current())
                }
            },
            None => Ok(AppVersion::current()),
        }
    }

    /// Fetch the remote descriptor and compare it with the local one.
    pub async fn check_for_updates(
        &self,
        transport: &dyn SyncTransport,
    ) -> Result<VersionComparison> {
        let remote = transport.fetch_version().await?;
        let current = self.get_current_version().await?;
        let applied = self.store.applied_migrations().await?;
        Ok(VersionComparison::between(&current, &remote, &applied))
    }

    /// Run pending migrations in declared order and store the new descriptor.
    ///
    /// Returns `true` when a full resync is required (breaking update or a
    /// migration ran). Stops at the first failing migration.
    pub async fn handle_app_update(&self, comparison: &VersionComparison) -> Result<bool> {
        let mut migrated = false;
        for name in &comparison.pending_migrations {
            let migration = self.registry.get(name).ok_or_else(|| {
                Error::Migration(format!("no migration registered under '{name}'"))
            })?;
            let ran = self
                .store
                .apply_migration(migration.as_ref())
                .await
                .map_err(|error| match error {
                    Error::Migration(_) => error,
                    other => Error::Migration(format!("{name}: {other}")),
                })?;
            if ran {
                tracing::info!(migration = %name, "Applied data migration");
                migrated = true;
            }
        }

        if comparison.update_available || migrated {
            let mut stored = comparison.remote.clone();
            let applied = self.store.applied_migrations().await?;
            for name in applied {
                if !stored.migrations.contains(&name) {
                    stored.migrations.push(name);
                }
            }
            let encoded = serde_json::to_string(&stored)?;
            self.store
                .set_state_value(keys::APP_VERSION, &encoded)
                .await?;
            tracing::info!(
                from = %comparison.current,
                to = %comparison.remote,
                update_type = ?comparison.update_type,
                "Recorded app version"
            );
        }

        Ok(comparison.breaking || migrated)
    }
}
