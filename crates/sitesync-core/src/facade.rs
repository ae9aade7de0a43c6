//! Offline-first entry point for business code.
//!
//! Every call goes to the local store first. Mutations queue their outbox
//! action in the same transaction and return immediately; when an engine is
//! attached and the network is up, a background sync is requested.

use serde_json::{Map, Value};

use crate::db::EntityCursor;
use crate::error::Result;
use crate::models::{
    ActionStatus, ActionType, Entity, EntityFilter, EntityId, EntityKind, OutboxAction,
};
use crate::services::{LocalMutation, LocalStore};
use crate::sync::{SyncEngine, SyncTrigger};
use crate::util::now;

#[derive(Clone)]
pub struct OfflineApi {
    store: LocalStore,
    engine: Option<SyncEngine>,
    push_on_write: bool,
}

impl OfflineApi {
    /// Facade with no sync attached; mutations only queue.
    pub const fn new(store: LocalStore) -> Self {
        Self {
            store,
            engine: None,
            push_on_write: false,
        }
    }

    /// Facade that nudges `engine` after writes (when enabled) and reads.
    pub fn with_engine(store: LocalStore, engine: SyncEngine) -> Self {
        let push_on_write = engine.config().push_on_write;
        Self {
            store,
            engine: Some(engine),
            push_on_write,
        }
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn engine(&self) -> Option<&SyncEngine> {
        self.engine.as_ref()
    }

    pub async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let entity = self.store.get(kind, id).await?;
        self.nudge(SyncTrigger::Refresh);
        Ok(entity)
    }

    pub async fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let entities = self.store.list(kind, filter).await?;
        self.nudge(SyncTrigger::Refresh);
        Ok(entities)
    }

    /// Lazy cursor over matching records
    pub async fn query(&self, kind: EntityKind, filter: &EntityFilter) -> Result<EntityCursor> {
        let cursor = self.store.query(kind, filter).await?;
        self.nudge(SyncTrigger::Refresh);
        Ok(cursor)
    }

    pub async fn create(&self, kind: EntityKind, data: Map<String, Value>) -> Result<Entity> {
        let committed = self
            .store
            .commit_mutation(kind, LocalMutation::Create { data }, action_builder(kind))
            .await?;
        self.after_write();
        committed
            .entity
            .ok_or_else(|| crate::Error::Database(format!("create of {kind} returned no record")))
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: Map<String, Value>,
    ) -> Result<Entity> {
        let committed = self
            .store
            .commit_mutation(
                kind,
                LocalMutation::Update {
                    id: id.clone(),
                    patch,
                },
                action_builder(kind),
            )
            .await?;
        self.after_write();
        committed
            .entity
            .ok_or_else(|| crate::Error::NotFound(format!("{kind} {id}")))
    }

    /// Idempotent; returns whether a record was removed.
    pub async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let committed = self
            .store
            .commit_mutation(
                kind,
                LocalMutation::Delete { id: id.clone() },
                action_builder(kind),
            )
            .await?;
        if committed.action.is_some() {
            self.after_write();
        }
        Ok(committed.entity.is_some())
    }

    /// Insert reference data once; later calls are no-ops.
    pub async fn bulk_seed(&self, kind: EntityKind, records: Vec<Map<String, Value>>) -> Result<usize> {
        self.store.bulk_seed(kind, records).await
    }

    /// Outbox entries awaiting acknowledgement
    pub async fn pending_actions(&self) -> Result<Vec<OutboxAction>> {
        let mut pending = self.store.outbox(Some(ActionStatus::Pending)).await?;
        pending.extend(self.store.outbox(Some(ActionStatus::Syncing)).await?);
        pending.sort_by_key(|action| action.timestamp);
        Ok(pending)
    }

    pub async fn outbox(&self, status: Option<ActionStatus>) -> Result<Vec<OutboxAction>> {
        self.store.outbox(status).await
    }

    fn after_write(&self) {
        if self.push_on_write {
            self.nudge(SyncTrigger::LocalChange);
        }
    }

    fn nudge(&self, trigger: SyncTrigger) {
        if let Some(engine) = &self.engine {
            if engine.network().is_online() {
                engine.request_sync(trigger);
            }
        }
    }
}

fn action_builder(
    kind: EntityKind,
) -> impl FnOnce(ActionType, &EntityId, Value) -> OutboxAction + Send {
    move |action_type, id, data| OutboxAction::new(action_type, kind, id.clone(), data, now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::authority::{AuthorityConfig, AuthorityStore};
    use crate::config::SyncConfig;
    use crate::models::SyncStatus;
    use crate::network::NetworkMonitor;
    use crate::sync::InProcessTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutations_queue_rest_actions() {
        let api = OfflineApi::new(LocalStore::open_in_memory().await.unwrap());

        let project = api
            .create(EntityKind::Project, object(json!({"name": "Bridge"})))
            .await
            .unwrap();
        assert_eq!(project.sync_status, SyncStatus::Pending);

        api.update(
            EntityKind::Project,
            &project.id,
            object(json!({"status": "active"})),
        )
        .await
        .unwrap();

        let queued = api.pending_actions().await.unwrap();
        let routes: Vec<_> = queued
            .iter()
            .map(|a| (a.method.as_str(), a.url.clone()))
            .collect();
        assert_eq!(
            routes,
            vec![
                ("POST", "/api/projects".to_string()),
                ("PUT", format!("/api/projects/{}", project.id)),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_missing_record_is_not_found() {
        let api = OfflineApi::new(LocalStore::open_in_memory().await.unwrap());
        let error = api
            .update(
                EntityKind::Equipment,
                &EntityId::from("missing"),
                object(json!({"status": "idle"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, crate::Error::NotFound(_)));
        assert!(api.outbox(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_with_taken_id_is_rejected_without_queueing() {
        let api = OfflineApi::new(LocalStore::open_in_memory().await.unwrap());
        api.create(
            EntityKind::Company,
            object(json!({"id": "acme", "name": "Acme"})),
        )
        .await
        .unwrap();

        let error = api
            .create(
                EntityKind::Company,
                object(json!({"id": "acme", "name": "Acme again"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, crate::Error::InvalidInput(_)));

        let stored = api
            .get(EntityKind::Company, &EntityId::from("acme"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data["name"], "Acme");
        assert_eq!(api.pending_actions().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_while_online_is_pushed_in_background() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let authority = AuthorityStore::open_in_memory(AuthorityConfig::default())
            .await
            .unwrap();
        let transport = Arc::new(InProcessTransport::new(authority.clone()));
        let network = NetworkMonitor::new(true, Duration::from_millis(10));
        let config = SyncConfig::default().with_sync_interval(Duration::from_secs(3600));
        let engine = SyncEngine::new(store.clone(), transport, network, config);
        let worker = engine.start().unwrap();
        let api = OfflineApi::with_engine(store, engine);

        let created = api
            .create(EntityKind::Warehouse, object(json!({"name": "North yard"})))
            .await
            .unwrap();

        let mut synced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if authority
                .record(EntityKind::Warehouse, &created.id)
                .await
                .unwrap()
                .is_some()
            {
                synced = true;
                break;
            }
        }
        worker.shutdown().await;
        assert!(synced);
    }
}
