//! Shared local store service used by the facade, the sync engine and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::db::{
    keys, transaction, ConflictRepository, Database, EntityCursor, EntityRepository,
    LibSqlConflictRepository, LibSqlEntityRepository, LibSqlOutboxRepository,
    LibSqlStateRepository, OutboxRepository, StateRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    strip_reserved, ActionId, ActionStatus, ActionType, Entity, EntityFilter, EntityId,
    EntityKind, OutboxAction, Resolution, SyncConflict, SyncStatus,
};
use crate::sync::protocol::ServerRecord;
use crate::util::now;
use crate::version::DataMigration;

const BASE_VERSION_KEY: &str = "baseVersion";

/// A local mutation the facade commits together with its outbox action
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    /// Insert a record; an `id` key in `data` is used when present
    Create { data: Map<String, Value> },
    /// Shallow-merge `patch` into an existing record; `null` removes a key
    Update {
        id: EntityId,
        patch: Map<String, Value>,
    },
    /// Remove a record
    Delete { id: EntityId },
}

/// Outcome of `LocalStore::commit_mutation`
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedMutation {
    /// Stored record after a create/update, the removed record after a delete
    pub entity: Option<Entity>,
    /// Action persisted in the outbox, if any
    pub action: Option<OutboxAction>,
}

/// Outbox and conflict totals used for sync state counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub pending_actions: usize,
    pub failed_actions: usize,
    pub open_conflicts: usize,
}

/// Thread-safe service for store and repository operations.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_file(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_file(db_path: &Path) -> Result<()> {
        if !db_path.exists() {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        let base_name = db_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sitesync.db");
        let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));
        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local store from {} to {}",
            db_path.display(),
            backup_path.display()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity CRUD (no outbox side effects)
    // ------------------------------------------------------------------

    /// Insert a new record. Assigns an id when `data` carries none.
    pub async fn create(&self, kind: EntityKind, data: Map<String, Value>) -> Result<Entity> {
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, create_in(conn, kind, data)).await
    }

    /// Shallow-merge `patch` into an existing record.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: Map<String, Value>,
    ) -> Result<Entity> {
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, update_in(conn, kind, id, patch)).await
    }

    /// Remove a record; absent records are not an error.
    pub async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.delete(kind, id).await
    }

    /// Fetch a record by id.
    pub async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.get(kind, id).await
    }

    /// Lazy cursor over matching records.
    pub async fn query(&self, kind: EntityKind, filter: &EntityFilter) -> Result<EntityCursor> {
        let db = self.db.lock().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.query(kind, filter).await
    }

    /// Collect matching records.
    pub async fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>> {
        self.query(kind, filter).await?.collect().await
    }

    /// Number of stored records of a kind.
    pub async fn count(&self, kind: EntityKind) -> Result<usize> {
        let db = self.db.lock().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.count(kind).await
    }

    /// Insert `records` as synced rows, only when the kind is still empty.
    ///
    /// Returns the number of rows inserted (0 when the guard skipped seeding).
    pub async fn bulk_seed(
        &self,
        kind: EntityKind,
        records: Vec<Map<String, Value>>,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let repo = LibSqlEntityRepository::new(conn);

        transaction(conn, async {
            if repo.count(kind).await? > 0 {
                return Ok(0);
            }
            let stamp = now();
            let mut inserted = 0;
            for mut data in records {
                let id = take_id(&mut data).unwrap_or_default();
                let entity = Entity {
                    id,
                    kind,
                    created_at: stamp,
                    last_modified: stamp,
                    sync_status: SyncStatus::Synced,
                    remote_version: None,
                    data: strip_reserved(data),
                };
                repo.put(&entity).await?;
                inserted += 1;
            }
            Ok(inserted)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Facade entry point
    // ------------------------------------------------------------------

    /// Apply a mutation and persist its outbox action in one transaction.
    ///
    /// `build_action` turns `(type, id, payload)` into the queued action.
    /// A delete drops unsent actions for the record; when that removes the
    /// record's unsent create, nothing is queued at all. Deleting an absent
    /// record queues nothing.
    pub async fn commit_mutation(
        &self,
        kind: EntityKind,
        mutation: LocalMutation,
        build_action: impl FnOnce(ActionType, &EntityId, Value) -> OutboxAction + Send,
    ) -> Result<CommittedMutation> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let outbox = LibSqlOutboxRepository::new(conn);

        transaction(conn, async {
            match mutation {
                LocalMutation::Create { data } => {
                    let entity = create_in(conn, kind, data).await?;
                    let action = build_action(ActionType::Create, &entity.id, entity.data_value());
                    outbox.insert(&action).await?;
                    Ok(CommittedMutation {
                        entity: Some(entity),
                        action: Some(action),
                    })
                }
                LocalMutation::Update { id, patch } => {
                    let entity = update_in(conn, kind, &id, patch).await?;
                    let action = build_action(ActionType::Update, &entity.id, entity.data_value());
                    outbox.insert(&action).await?;
                    Ok(CommittedMutation {
                        entity: Some(entity),
                        action: Some(action),
                    })
                }
                LocalMutation::Delete { id } => {
                    let entities = LibSqlEntityRepository::new(conn);
                    let Some(removed) = entities.get(kind, &id).await? else {
                        return Ok(CommittedMutation {
                            entity: None,
                            action: None,
                        });
                    };
                    entities.delete(kind, &id).await?;

                    let prior = outbox.for_entity(kind, &id).await?;
                    let in_flight = prior.iter().any(|a| a.status == ActionStatus::Syncing);
                    let mut dropped_create = false;
                    for action in prior
                        .iter()
                        .filter(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::Failed))
                    {
                        dropped_create |= action.action_type == ActionType::Create;
                        outbox.remove(&action.id).await?;
                    }

                    if dropped_create && !in_flight && removed.remote_version.is_none() {
                        return Ok(CommittedMutation {
                            entity: Some(removed),
                            action: None,
                        });
                    }

                    let action = build_action(ActionType::Delete, &id, delete_payload(&removed));
                    outbox.insert(&action).await?;
                    Ok(CommittedMutation {
                        entity: Some(removed),
                        action: Some(action),
                    })
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    /// Outbox entries, optionally filtered by status.
    pub async fn outbox(&self, status: Option<ActionStatus>) -> Result<Vec<OutboxAction>> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .list(status)
            .await
    }

    /// Pending entries eligible for push, in send order.
    pub async fn pushable_actions(&self) -> Result<Vec<OutboxAction>> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .pushable()
            .await
    }

    /// Unfinished entries for one record.
    pub async fn actions_for(&self, kind: EntityKind, id: &EntityId) -> Result<Vec<OutboxAction>> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .for_entity(kind, id)
            .await
    }

    /// Set status (and error text) on a set of entries atomically.
    pub async fn set_action_status(
        &self,
        ids: &[ActionId],
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let repo = LibSqlOutboxRepository::new(conn);
        transaction(conn, async {
            for id in ids {
                repo.set_status(id, status, error).await?;
            }
            Ok(())
        })
        .await
    }

    /// Increment retry counters; returns the highest resulting count.
    pub async fn increment_retries(&self, ids: &[ActionId]) -> Result<u32> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let repo = LibSqlOutboxRepository::new(conn);
        transaction(conn, async {
            let mut highest = 0;
            for id in ids {
                highest = highest.max(repo.increment_retry(id).await?);
            }
            Ok(highest)
        })
        .await
    }

    /// Reset failed entries to pending with a fresh retry budget.
    pub async fn reset_failed_actions(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .reset_failed()
            .await
    }

    /// Return entries stranded in `syncing` to `pending`.
    pub async fn revert_syncing_actions(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .revert_syncing()
            .await
    }

    /// Outbox and conflict totals.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let outbox = LibSqlOutboxRepository::new(conn);
        let conflicts = LibSqlConflictRepository::new(conn);
        Ok(StoreCounts {
            pending_actions: outbox.count(ActionStatus::Pending).await?
                + outbox.count(ActionStatus::Syncing).await?,
            failed_actions: outbox.count(ActionStatus::Failed).await?,
            open_conflicts: conflicts.count_open().await?,
        })
    }

    // ------------------------------------------------------------------
    // Applying remote state
    // ------------------------------------------------------------------

    /// Settle one acknowledged outbox action.
    ///
    /// Removes the action, reconciles the id when the server issued a
    /// different one, then adopts the server record if nothing else is
    /// queued for it (otherwise only its version). Returns the record's
    /// current id.
    pub async fn apply_ack(
        &self,
        kind: EntityKind,
        local_id: &EntityId,
        action_id: &ActionId,
        server: Option<&ServerRecord>,
    ) -> Result<EntityId> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let outbox = LibSqlOutboxRepository::new(conn);
        let entities = LibSqlEntityRepository::new(conn);

        transaction(conn, async {
            outbox.remove(action_id).await?;

            let mut id = local_id.clone();
            if let Some(server) = server {
                if server.id != *local_id {
                    reconcile_in(conn, kind, local_id, &server.id).await?;
                    id = server.id.clone();
                }
            }

            let Some(server) = server else {
                return Ok(id);
            };
            let remaining = outbox.for_entity(kind, &id).await?;
            if remaining.is_empty() {
                if entities.get(kind, &id).await?.is_some() {
                    entities.put(&server.to_entity(kind)).await?;
                }
            } else {
                entities
                    .mark(kind, &id, SyncStatus::Pending, Some(server.version))
                    .await?;
            }
            Ok(id)
        })
        .await
    }

    /// Mirror a server record into the store as synced.
    pub async fn adopt_server(&self, kind: EntityKind, record: &ServerRecord) -> Result<Entity> {
        let db = self.db.lock().await;
        let entity = record.to_entity(kind);
        LibSqlEntityRepository::new(db.connection())
            .put(&entity)
            .await?;
        Ok(entity)
    }

    /// Remove a record and anything queued for it.
    pub async fn remove_local(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let outbox = LibSqlOutboxRepository::new(conn);
        transaction(conn, async {
            outbox.remove_for_entity(kind, id).await?;
            entities.delete(kind, id).await
        })
        .await
    }

    /// Re-key a record to a server-issued id in one transaction.
    pub async fn reconcile_id(&self, kind: EntityKind, old: &EntityId, new: &EntityId) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, reconcile_in(conn, kind, old, new)).await
    }

    /// Server id a local id was reconciled to.
    pub async fn mapped_id(&self, kind: EntityKind, local: &EntityId) -> Result<Option<EntityId>> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .mapped_id(kind, local)
            .await
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Record (or refresh) the open conflict for a record and flag the record.
    ///
    /// `server_version` carries the tombstone version when the server side
    /// is a deletion.
    pub async fn record_conflict(
        &self,
        kind: EntityKind,
        id: &EntityId,
        server: Option<&ServerRecord>,
        server_version: Option<i64>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let conflicts = LibSqlConflictRepository::new(conn);

        transaction(conn, async {
            let local = entities.get(kind, id).await?;
            let conflict_id = conflicts
                .record(kind, id, local.as_ref(), server, server_version, now())
                .await?;
            if local.is_some() {
                entities.mark(kind, id, SyncStatus::Conflict, None).await?;
            }
            Ok(conflict_id)
        })
        .await
    }

    /// Fetch a conflict by id.
    pub async fn conflict(&self, id: i64) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection()).get(id).await
    }

    /// Open conflict for a record, if any.
    pub async fn open_conflict_for(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .open_for(kind, id)
            .await
    }

    /// Conflicts, newest first.
    pub async fn conflicts(&self, include_resolved: bool) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list(include_resolved)
            .await
    }

    /// Delete resolved conflicts older than `retention`.
    pub async fn prune_conflicts(&self, retention: std::time::Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|error| Error::Config(error.to_string()))?;
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .prune_resolved(now() - retention)
            .await
    }

    /// Settle a conflict by adopting the server side.
    pub async fn resolve_with_server(&self, conflict: &SyncConflict) -> Result<()> {
        self.accept_server(
            conflict.entity,
            &conflict.entity_id,
            conflict.server_data.as_ref(),
        )
        .await
    }

    /// Discard local changes for a record in favour of the server side.
    ///
    /// Stores the server copy (or removes the record when the server has
    /// none), drops queued actions and closes any open conflict as `server`.
    pub async fn accept_server(
        &self,
        kind: EntityKind,
        id: &EntityId,
        server: Option<&ServerRecord>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let outbox = LibSqlOutboxRepository::new(conn);
        let conflicts = LibSqlConflictRepository::new(conn);

        transaction(conn, async {
            match server {
                Some(server) => entities.put(&server.to_entity(kind)).await?,
                None => {
                    entities.delete(kind, id).await?;
                }
            }
            outbox.remove_for_entity(kind, id).await?;
            if let Some(open) = conflicts.open_for(kind, id).await? {
                conflicts
                    .mark_resolved(open.id, Resolution::Server, now())
                    .await?;
            }
            Ok(())
        })
        .await
    }

    /// Settle a conflict by storing `data` as pending and queueing it.
    ///
    /// The record adopts the server's version (a tombstone's, when the
    /// server deleted it) as its base so the next push overwrites that
    /// version. Only a record the server has never seen is queued as a
    /// create.
    pub async fn resolve_with_data(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        data: Map<String, Value>,
        build_action: impl FnOnce(ActionType, &EntityId, Value) -> OutboxAction + Send,
    ) -> Result<Entity> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let outbox = LibSqlOutboxRepository::new(conn);
        let conflicts = LibSqlConflictRepository::new(conn);

        transaction(conn, async {
            let existing = entities.get(conflict.entity, &conflict.entity_id).await?;
            let server = conflict.server_data.as_ref();
            let server_version = conflict
                .server_version
                .or_else(|| server.map(|s| s.version));
            let stamp = now();
            let created_at = existing
                .as_ref()
                .map(|e| e.created_at)
                .or_else(|| server.map(|s| s.created_at))
                .unwrap_or(stamp);
            let previous = existing.as_ref().map_or(stamp, |e| e.last_modified);

            let entity = Entity {
                id: conflict.entity_id.clone(),
                kind: conflict.entity,
                created_at,
                last_modified: stamp.max(previous),
                sync_status: SyncStatus::Pending,
                remote_version: server_version
                    .or_else(|| existing.as_ref().and_then(|e| e.remote_version)),
                data: strip_reserved(data),
            };
            entities.put(&entity).await?;

            outbox
                .remove_for_entity(conflict.entity, &conflict.entity_id)
                .await?;
            let action_type = if entity.remote_version.is_some() {
                ActionType::Update
            } else {
                ActionType::Create
            };
            let action = build_action(action_type, &entity.id, entity.data_value());
            outbox.insert(&action).await?;

            conflicts.mark_resolved(conflict.id, resolution, stamp).await?;
            Ok(entity)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Key-value state and data migrations
    // ------------------------------------------------------------------

    /// Read a scalar from the sync state table.
    pub async fn state_value(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection()).get(key).await
    }

    /// Write a scalar to the sync state table.
    pub async fn set_state_value(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .set(key, value)
            .await
    }

    /// Remove a scalar from the sync state table.
    pub async fn clear_state_value(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .remove(key)
            .await
    }

    /// Read a timestamp scalar.
    pub async fn state_time(&self, key: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .get_time(key)
            .await
    }

    /// Persist the end-of-cycle checkpoint atomically.
    pub async fn checkpoint(
        &self,
        last_sync_time: chrono::DateTime<chrono::Utc>,
        pull_cursor: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let state = LibSqlStateRepository::new(conn);
        transaction(conn, async {
            state.set_time(keys::LAST_SYNC_TIME, last_sync_time).await?;
            if let Some(cursor) = pull_cursor {
                state.set_time(keys::PULL_CURSOR, cursor).await?;
            }
            Ok(())
        })
        .await
    }

    /// Stable id of this installation, created on first use.
    pub async fn client_id(&self) -> Result<String> {
        let db = self.db.lock().await;
        let state = LibSqlStateRepository::new(db.connection());
        if let Some(id) = state.get(keys::CLIENT_ID).await? {
            return Ok(id);
        }
        let id = uuid::Uuid::now_v7().to_string();
        state.set(keys::CLIENT_ID, &id).await?;
        Ok(id)
    }

    /// Names of data migrations already applied.
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .applied_migrations()
            .await
    }

    /// Run a data migration in one transaction and record it.
    ///
    /// Returns `false` when the migration had already been applied.
    pub async fn apply_migration(&self, migration: &dyn DataMigration) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let state = LibSqlStateRepository::new(conn);

        let name = migration.name();
        if state.applied_migrations().await?.iter().any(|n| n == name) {
            return Ok(false);
        }

        transaction(conn, async {
            migration.apply(conn).await?;
            state.mark_migration(name, now()).await
        })
        .await?;
        Ok(true)
    }
}

/// Delete actions carry the last adopted server version, since the record
/// itself is gone by the time the action is pushed.
fn delete_payload(removed: &Entity) -> Value {
    removed
        .remote_version
        .map_or(Value::Null, |version| serde_json::json!({ BASE_VERSION_KEY: version }))
}

/// Server version recorded in a delete action's payload, if any.
pub fn delete_base_version(action: &OutboxAction) -> Option<i64> {
    action.data.get(BASE_VERSION_KEY).and_then(Value::as_i64)
}

/// Pull a caller-supplied id out of record data
fn take_id(data: &mut Map<String, Value>) -> Option<EntityId> {
    match data.remove("id") {
        Some(Value::String(id)) => id.parse().ok(),
        Some(Value::Number(id)) => Some(EntityId::from(id.to_string())),
        _ => None,
    }
}

async fn create_in(
    conn: &libsql::Connection,
    kind: EntityKind,
    mut data: Map<String, Value>,
) -> Result<Entity> {
    let repo = LibSqlEntityRepository::new(conn);
    let id = take_id(&mut data).unwrap_or_default();
    if repo.get(kind, &id).await?.is_some() {
        return Err(Error::InvalidInput(format!("{kind} {id} already exists")));
    }

    let stamp = now();
    let entity = Entity {
        id,
        kind,
        created_at: stamp,
        last_modified: stamp,
        sync_status: SyncStatus::Pending,
        remote_version: None,
        data: strip_reserved(data),
    };
    repo.put(&entity).await?;
    Ok(entity)
}

async fn update_in(
    conn: &libsql::Connection,
    kind: EntityKind,
    id: &EntityId,
    patch: Map<String, Value>,
) -> Result<Entity> {
    let repo = LibSqlEntityRepository::new(conn);
    let mut entity = repo
        .get(kind, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?;

    for (key, value) in strip_reserved(patch) {
        if value.is_null() {
            entity.data.remove(&key);
        } else {
            entity.data.insert(key, value);
        }
    }
    entity.last_modified = now().max(entity.last_modified);
    entity.sync_status = SyncStatus::Pending;

    repo.put(&entity).await?;
    Ok(entity)
}

async fn reconcile_in(
    conn: &libsql::Connection,
    kind: EntityKind,
    old: &EntityId,
    new: &EntityId,
) -> Result<()> {
    let entities = LibSqlEntityRepository::new(conn);
    if entities.get(kind, new).await?.is_some() {
        // Server id already present locally (e.g. pulled first); drop the stale copy.
        entities.delete(kind, old).await?;
    } else {
        entities.rekey(kind, old, new).await?;
    }
    entities.rewrite_references(old, new).await?;
    LibSqlOutboxRepository::new(conn).rekey(kind, old, new).await?;
    LibSqlConflictRepository::new(conn)
        .rekey(kind, old, new)
        .await?;
    LibSqlStateRepository::new(conn)
        .map_id(kind, old, new, now())
        .await?;
    tracing::info!(entity = %kind, local_id = %old, server_id = %new, "Reconciled local id");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn server(id: &str, version: i64, fields: Value) -> ServerRecord {
        ServerRecord {
            id: EntityId::from(id),
            version,
            created_at: now(),
            last_modified: now(),
            fields: object(fields),
        }
    }

    async fn commit(
        store: &LocalStore,
        kind: EntityKind,
        mutation: LocalMutation,
    ) -> CommittedMutation {
        store
            .commit_mutation(kind, mutation, |action_type, id, data| {
                OutboxAction::new(action_type, kind, id.clone(), data, now())
            })
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_assigns_metadata() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let entity = store
            .create(
                EntityKind::Project,
                object(json!({"name": "Bridge", "syncStatus": "synced"})),
            )
            .await
            .unwrap();

        assert_eq!(entity.sync_status, SyncStatus::Pending);
        assert_eq!(entity.created_at, entity.last_modified);
        assert!(!entity.data.contains_key("syncStatus"));
        assert!(store.outbox(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_and_removes_null_keys() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let created = store
            .create(
                EntityKind::Equipment,
                object(json!({"name": "Crane", "status": "idle", "note": "x"})),
            )
            .await
            .unwrap();

        let updated = store
            .update(
                EntityKind::Equipment,
                &created.id,
                object(json!({"status": "active", "note": null})),
            )
            .await
            .unwrap();
        assert_eq!(updated.data, object(json!({"name": "Crane", "status": "active"})));
        assert!(updated.last_modified >= created.last_modified);

        let missing = store
            .update(EntityKind::Equipment, &EntityId::from("nope"), Map::new())
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_is_idempotent() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let created = store
            .create(EntityKind::User, object(json!({"name": "Ana"})))
            .await
            .unwrap();

        assert!(store.delete(EntityKind::User, &created.id).await.unwrap());
        assert!(!store.delete(EntityKind::User, &created.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_seed_runs_once() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let records = vec![
            object(json!({"id": "co-1", "name": "Acme"})),
            object(json!({"id": "co-2", "name": "Globex"})),
        ];

        assert_eq!(
            store
                .bulk_seed(EntityKind::Company, records.clone())
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.bulk_seed(EntityKind::Company, records).await.unwrap(), 0);
        assert_eq!(store.count(EntityKind::Company).await.unwrap(), 2);

        let seeded = store
            .get(EntityKind::Company, &EntityId::from("co-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seeded.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_unsynced_record_nets_to_nothing() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let created = commit(
            &store,
            EntityKind::Project,
            LocalMutation::Create {
                data: object(json!({"name": "Temp"})),
            },
        )
        .await;
        let id = created.entity.unwrap().id;
        commit(
            &store,
            EntityKind::Project,
            LocalMutation::Update {
                id: id.clone(),
                patch: object(json!({"name": "Temp 2"})),
            },
        )
        .await;

        let deleted = commit(&store, EntityKind::Project, LocalMutation::Delete { id }).await;
        assert!(deleted.entity.is_some());
        assert!(deleted.action.is_none());
        assert!(store.outbox(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_synced_record_supersedes_updates() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .adopt_server(EntityKind::Project, &server("p-1", 1, json!({"name": "A"})))
            .await
            .unwrap();
        let id = EntityId::from("p-1");
        commit(
            &store,
            EntityKind::Project,
            LocalMutation::Update {
                id: id.clone(),
                patch: object(json!({"name": "B"})),
            },
        )
        .await;

        commit(&store, EntityKind::Project, LocalMutation::Delete { id: id.clone() }).await;
        let queued = store.outbox(None).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action_type, ActionType::Delete);
        assert_eq!(delete_base_version(&queued[0]), Some(1));

        // Second delete of the now-absent record queues nothing more.
        let again = commit(&store, EntityKind::Project, LocalMutation::Delete { id }).await;
        assert!(again.entity.is_none());
        assert_eq!(store.outbox(None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ack_with_new_id_reconciles_references() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let project = commit(
            &store,
            EntityKind::Project,
            LocalMutation::Create {
                data: object(json!({"name": "Tower"})),
            },
        )
        .await;
        let project_id = project.entity.unwrap().id;
        let action_id = project.action.unwrap().id;

        let tx = commit(
            &store,
            EntityKind::Transaction,
            LocalMutation::Create {
                data: object(json!({"projectId": project_id.as_str(), "amount": 10})),
            },
        )
        .await
        .entity
        .unwrap();

        let canonical = server("srv-77", 1, json!({"name": "Tower"}));
        let id = store
            .apply_ack(EntityKind::Project, &project_id, &action_id, Some(&canonical))
            .await
            .unwrap();
        assert_eq!(id, EntityId::from("srv-77"));

        assert!(store
            .get(EntityKind::Project, &project_id)
            .await
            .unwrap()
            .is_none());
        let adopted = store.get(EntityKind::Project, &id).await.unwrap().unwrap();
        assert_eq!(adopted.sync_status, SyncStatus::Synced);
        assert_eq!(adopted.remote_version, Some(1));

        let child = store.get(EntityKind::Transaction, &tx.id).await.unwrap().unwrap();
        assert_eq!(child.data["projectId"], "srv-77");
        let queued = store.actions_for(EntityKind::Transaction, &tx.id).await.unwrap();
        assert_eq!(queued[0].data["projectId"], "srv-77");
        assert_eq!(
            store.mapped_id(EntityKind::Project, &project_id).await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_resolution_with_server_clears_outbox() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .adopt_server(EntityKind::Project, &server("p-1", 1, json!({"name": "A"})))
            .await
            .unwrap();
        let id = EntityId::from("p-1");
        commit(
            &store,
            EntityKind::Project,
            LocalMutation::Update {
                id: id.clone(),
                patch: object(json!({"name": "local"})),
            },
        )
        .await;

        let remote = server("p-1", 2, json!({"name": "remote"}));
        let conflict_id = store
            .record_conflict(EntityKind::Project, &id, Some(&remote), None)
            .await
            .unwrap();
        assert_eq!(
            store.get(EntityKind::Project, &id).await.unwrap().unwrap().sync_status,
            SyncStatus::Conflict
        );
        assert!(store.pushable_actions().await.unwrap().is_empty());

        let conflict = store.conflict(conflict_id).await.unwrap().unwrap();
        store.resolve_with_server(&conflict).await.unwrap();

        let record = store.get(EntityKind::Project, &id).await.unwrap().unwrap();
        assert_eq!(record.data["name"], "remote");
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(store.outbox(None).await.unwrap().is_empty());
        assert_eq!(store.counts().await.unwrap().open_conflicts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_id_is_stable_across_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("client.db");

        let first = LocalStore::open_path(&path).await.unwrap().client_id().await.unwrap();
        let second = LocalStore::open_path(&path).await.unwrap().client_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupted_file_is_moved_aside() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("client.db");
        std::fs::write(&path, vec![b'x'; 8192]).unwrap();

        let store = LocalStore::open_path(&path).await.unwrap();
        assert_eq!(store.count(EntityKind::Project).await.unwrap(), 0);

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(backups, 1);
    }
}
