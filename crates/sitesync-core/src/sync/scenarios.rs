//! End-to-end sync cycles against an in-process authority.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tempfile::tempdir;

use crate::authority::{AuthorityConfig, AuthorityStore};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::facade::OfflineApi;
use crate::models::{
    ActionStatus, AppVersion, EntityFilter, EntityId, EntityKind, Resolution, SyncErrorKind,
    SyncPhase, SyncStatus,
};
use crate::network::NetworkMonitor;
use crate::services::LocalStore;

use super::protocol::{BatchRequest, BatchResponse, RemoteChange};
use super::{
    InProcessTransport, SkipReason, SyncEngine, SyncEvent, SyncOutcome, SyncTransport,
    SyncTrigger,
};

fn object(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_sync_interval(Duration::from_secs(3600))
        .with_retry_base_delay(Duration::from_millis(5))
        .with_reconnect_debounce(Duration::from_millis(10))
}

struct Client {
    store: LocalStore,
    network: NetworkMonitor,
    engine: SyncEngine,
    api: OfflineApi,
}

impl Client {
    async fn new(transport: Arc<dyn SyncTransport>, online: bool) -> Self {
        Self::with_store(LocalStore::open_in_memory().await.unwrap(), transport, online)
    }

    fn with_store(store: LocalStore, transport: Arc<dyn SyncTransport>, online: bool) -> Self {
        let network = NetworkMonitor::new(online, Duration::from_millis(10));
        let engine = SyncEngine::new(store.clone(), transport, network.clone(), test_config());
        let api = OfflineApi::new(store.clone());
        Self {
            store,
            network,
            engine,
            api,
        }
    }

    async fn sync(&self) -> super::SyncReport {
        match self.engine.trigger_sync(SyncTrigger::Manual).await {
            SyncOutcome::Completed(report) => report,
            other => panic!("sync did not complete: {other:?}"),
        }
    }
}

async fn authority(config: AuthorityConfig) -> (AuthorityStore, Arc<InProcessTransport>) {
    let store = AuthorityStore::open_in_memory(config).await.unwrap();
    let transport = Arc::new(InProcessTransport::new(store.clone()));
    (store, transport)
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_create_is_pushed_after_reconnect() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let client = Client::new(transport, false).await;

    let project = client
        .api
        .create(EntityKind::Project, object(json!({"name": "X"})))
        .await
        .unwrap();
    assert_eq!(project.sync_status, SyncStatus::Pending);
    assert_eq!(client.api.pending_actions().await.unwrap().len(), 1);
    assert_eq!(
        client.engine.trigger_sync(SyncTrigger::Manual).await,
        SyncOutcome::Skipped(SkipReason::Offline)
    );

    client.network.set_online(true);
    let report = client.sync().await;
    assert_eq!(report.pushed, 1);

    let stored = client
        .store
        .get(EntityKind::Project, &project.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert_eq!(stored.remote_version, Some(1));
    assert!(client.store.outbox(None).await.unwrap().is_empty());
    assert!(server
        .record(EntityKind::Project, &project.id)
        .await
        .unwrap()
        .is_some());

    let state = client.engine.state();
    assert_eq!(state.pending_actions, 0);
    assert_eq!(state.sync_progress, 0);
    assert_eq!(state.phase, SyncPhase::Idle);
    assert!(state.last_sync_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_surface_one_conflict_and_merge_resolves_it() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let created = a
        .api
        .create(
            EntityKind::Transaction,
            object(json!({"amount": 100, "memo": "rebar"})),
        )
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;
    assert!(b
        .store
        .get(EntityKind::Transaction, &created.id)
        .await
        .unwrap()
        .is_some());

    a.network.set_online(false);
    b.network.set_online(false);
    a.api
        .update(
            EntityKind::Transaction,
            &created.id,
            object(json!({"amount": 120})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.api
        .update(
            EntityKind::Transaction,
            &created.id,
            object(json!({"supplier": "Steelco"})),
        )
        .await
        .unwrap();

    a.network.set_online(true);
    a.sync().await;
    b.network.set_online(true);
    let mut events = b.engine.subscribe_events();
    let report = b.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(b.engine.state().conflict_count, 1);

    let conflicts = b.store.conflicts(false).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict_id = conflicts[0].id;
    let mut detected = false;
    while let Ok(event) = events.try_recv() {
        detected |= matches!(event, SyncEvent::ConflictDetected { conflict_id: id, .. } if id == conflict_id);
    }
    assert!(detected);

    // A repeated cycle refreshes the same conflict rather than adding one.
    b.sync().await;
    assert_eq!(b.store.conflicts(false).await.unwrap().len(), 1);

    b.engine
        .resolve_conflict(conflict_id, Resolution::Merge)
        .await
        .unwrap();
    assert_eq!(b.engine.state().conflict_count, 0);
    b.sync().await;

    let canonical = server
        .record(EntityKind::Transaction, &created.id)
        .await
        .unwrap()
        .unwrap();
    // Server wins on overlapping fields; B's new field survives.
    assert_eq!(canonical.fields["amount"], 120);
    assert_eq!(canonical.fields["memo"], "rebar");
    assert_eq!(canonical.fields["supplier"], "Steelco");
    assert_eq!(canonical.version, 3);

    let local = b
        .store
        .get(EntityKind::Transaction, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(b.store.conflicts(false).await.unwrap().is_empty());
    let resolved = b.store.conflict(conflict_id).await.unwrap().unwrap();
    assert_eq!(resolved.resolution, Some(Resolution::Merge));
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_server_edit_is_adopted_without_a_conflict() {
    let (_server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let created = a
        .api
        .create(EntityKind::Equipment, object(json!({"status": "idle"})))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;

    b.network.set_online(false);
    b.api
        .update(
            EntityKind::Equipment,
            &created.id,
            object(json!({"status": "broken"})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    a.api
        .update(
            EntityKind::Equipment,
            &created.id,
            object(json!({"status": "in-use"})),
        )
        .await
        .unwrap();
    a.sync().await;

    b.network.set_online(true);
    let report = b.sync().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.auto_resolved, 1);
    let local = b
        .store
        .get(EntityKind::Equipment, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.data["status"], "in-use");
    assert!(b.store.outbox(None).await.unwrap().is_empty());
}

/// Applies pushes but loses the first response on the way back.
struct LossyTransport {
    inner: InProcessTransport,
    drops_left: AtomicUsize,
    pushes: AtomicUsize,
}

#[async_trait]
impl SyncTransport for LossyTransport {
    async fn fetch_version(&self) -> Result<AppVersion> {
        self.inner.fetch_version().await
    }

    async fn push_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let response = self.inner.push_batch(batch).await?;
        if self
            .drops_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Network("connection reset".to_string()));
        }
        Ok(response)
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        self.inner.pull_changes(since).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resent_batch_after_lost_response_applies_once() {
    let server = AuthorityStore::open_in_memory(AuthorityConfig::default())
        .await
        .unwrap();
    let transport = Arc::new(LossyTransport {
        inner: InProcessTransport::new(server.clone()),
        drops_left: AtomicUsize::new(1),
        pushes: AtomicUsize::new(0),
    });
    let client = Client::new(transport.clone(), true).await;

    client
        .api
        .create(EntityKind::Document, object(json!({"title": "Permit"})))
        .await
        .unwrap();
    let report = client.sync().await;

    assert_eq!(transport.pushes.load(Ordering::SeqCst), 2);
    assert_eq!(report.pushed, 1);
    assert_eq!(server.live_count(EntityKind::Document).await.unwrap(), 1);
    assert!(client.store.outbox(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_responses_fail_batch_after_retries() {
    let (_server, transport) = authority(AuthorityConfig::default()).await;
    let client = Client::new(transport.clone(), true).await;
    client
        .api
        .create(EntityKind::User, object(json!({"name": "Ana"})))
        .await
        .unwrap();

    // Every push lands but its response never comes back.
    let flaky = Arc::new(LossyTransport {
        inner: InProcessTransport::new(transport.authority().clone()),
        drops_left: AtomicUsize::new(usize::MAX),
        pushes: AtomicUsize::new(0),
    });
    let client = Client::with_store(client.store.clone(), flaky.clone(), true);

    let outcome = client.engine.trigger_sync(SyncTrigger::Manual).await;
    let SyncOutcome::Failed(record) = outcome.clone() else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(record.kind, SyncErrorKind::Network);
    assert_eq!(flaky.pushes.load(Ordering::SeqCst), 3);

    let failed = client
        .store
        .outbox(Some(ActionStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert_eq!(client.engine.state().failed_actions, 1);

    assert_eq!(client.engine.retry_failed().await.unwrap(), 1);
    let pending = client
        .store
        .outbox(Some(ActionStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_operation_is_marked_failed_and_not_retried() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let client = Client::new(transport, true).await;

    // Known locally as synced, but the authority has never seen it.
    client
        .store
        .bulk_seed(
            EntityKind::Company,
            vec![object(json!({"id": "c-1", "name": "Acme"}))],
        )
        .await
        .unwrap();
    client
        .api
        .update(
            EntityKind::Company,
            &EntityId::from("c-1"),
            object(json!({"name": "Acme Ltd"})),
        )
        .await
        .unwrap();

    let report = client.sync().await;
    assert_eq!(report.failed, 1);
    let failed = client
        .store
        .outbox(Some(ActionStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.is_some());
    let state = client.engine.state();
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].kind, SyncErrorKind::Validation);
    assert_eq!(state.errors[0].action_id.as_ref(), Some(&failed[0].id));

    client.sync().await;
    assert_eq!(server.live_count(EntityKind::Company).await.unwrap(), 0);
    assert_eq!(
        client
            .store
            .outbox(Some(ActionStatus::Failed))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_migration_blocks_push_until_manual_retry() {
    let mut remote = AppVersion::current();
    remote.migrations = vec!["010-split-ledger".to_string()];
    let (server, transport) = authority(AuthorityConfig {
        version: remote,
        ..AuthorityConfig::default()
    })
    .await;
    let client = Client::new(transport, true).await;
    client
        .api
        .create(EntityKind::Project, object(json!({"name": "Dam"})))
        .await
        .unwrap();

    let outcome = client.engine.trigger_sync(SyncTrigger::Manual).await;
    let SyncOutcome::Failed(record) = outcome.clone() else {
        panic!("expected migration failure, got {outcome:?}");
    };
    assert_eq!(record.kind, SyncErrorKind::Migration);
    assert_eq!(server.live_count(EntityKind::Project).await.unwrap(), 0);
    assert_eq!(
        client
            .store
            .outbox(Some(ActionStatus::Pending))
            .await
            .unwrap()
            .len(),
        1
    );

    assert_eq!(
        client.engine.trigger_sync(SyncTrigger::Periodic).await,
        SyncOutcome::Skipped(SkipReason::MigrationBlocked)
    );
    assert!(matches!(
        client.engine.trigger_sync(SyncTrigger::Manual).await,
        SyncOutcome::Failed(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_never_decreases_within_a_cycle() {
    let (_server, transport) = authority(AuthorityConfig::default()).await;
    let store = LocalStore::open_in_memory().await.unwrap();
    let network = NetworkMonitor::new(true, Duration::from_millis(10));
    let engine = SyncEngine::new(
        store.clone(),
        transport,
        network,
        test_config().with_batch_size(2),
    );
    let api = OfflineApi::new(store);
    for index in 0..5 {
        api.create(EntityKind::Warehouse, object(json!({"name": format!("W{index}")})))
            .await
            .unwrap();
    }

    let mut events = engine.subscribe_events();
    assert!(matches!(
        engine.trigger_sync(SyncTrigger::Manual).await,
        SyncOutcome::Completed(_)
    ));

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Progress { progress: value, .. } = event {
            progress.push(value);
        }
    }
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.first(), Some(&10));
    assert_eq!(progress.last(), Some(&100));
    // Three batches interpolate between pushing and pulling.
    assert!(progress.iter().any(|p| *p > 25 && *p < 60));
    assert_eq!(engine.state().sync_progress, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_writes_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("site.db");
    let (server, transport) = authority(AuthorityConfig::default()).await;

    let id = {
        let store = LocalStore::open_path(&path).await.unwrap();
        let api = OfflineApi::new(store);
        api.create(EntityKind::Project, object(json!({"name": "Tunnel"})))
            .await
            .unwrap()
            .id
    };

    let store = LocalStore::open_path(&path).await.unwrap();
    assert_eq!(store.outbox(None).await.unwrap().len(), 1);
    let client = Client::with_store(store, transport, true);
    client.sync().await;
    assert!(server
        .record(EntityKind::Project, &id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn minted_server_ids_are_reconciled_locally() {
    let (server, transport) = authority(AuthorityConfig {
        assigns_ids: true,
        ..AuthorityConfig::default()
    })
    .await;
    let client = Client::new(transport, true).await;

    let project = client
        .api
        .create(EntityKind::Project, object(json!({"name": "Harbor"})))
        .await
        .unwrap();
    let spend = client
        .api
        .create(
            EntityKind::Transaction,
            object(json!({"amount": 5, "projectId": project.id.as_str()})),
        )
        .await
        .unwrap();
    client.sync().await;

    let server_project = client
        .store
        .mapped_id(EntityKind::Project, &project.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(server_project, project.id);
    assert!(client
        .store
        .get(EntityKind::Project, &project.id)
        .await
        .unwrap()
        .is_none());

    let server_spend = client
        .store
        .mapped_id(EntityKind::Transaction, &spend.id)
        .await
        .unwrap()
        .unwrap();
    let local_spend = client
        .store
        .get(EntityKind::Transaction, &server_spend)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local_spend.data["projectId"], server_project.as_str());

    let filtered = client
        .store
        .list(
            EntityKind::Transaction,
            &EntityFilter::new().project(server_project.as_str()),
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let canonical = server
        .record(EntityKind::Transaction, &server_spend)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canonical.fields["projectId"], server_project.as_str());
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_deletes_are_mirrored_when_nothing_is_pending() {
    let (_server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let created = a
        .api
        .create(EntityKind::Document, object(json!({"title": "Spec sheet"})))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;

    assert!(a.api.delete(EntityKind::Document, &created.id).await.unwrap());
    a.sync().await;
    let report = b.sync().await;
    assert_eq!(report.pulled, 1);
    assert!(b
        .store
        .get(EntityKind::Document, &created.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_syncs_on_reconnect() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let client = Client::new(transport, false).await;
    let worker = client.engine.start().unwrap();

    let project = client
        .api
        .create(EntityKind::Project, object(json!({"name": "Depot"})))
        .await
        .unwrap();
    client.network.set_online(true);

    let mut pushed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if server
            .record(EntityKind::Project, &project.id)
            .await
            .unwrap()
            .is_some()
        {
            pushed = true;
            break;
        }
    }
    worker.shutdown().await;
    assert!(pushed);
    assert!(client.engine.state().is_online);
}

#[tokio::test(flavor = "multi_thread")]
async fn keeping_local_edit_restores_a_remotely_deleted_record() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let created = a
        .api
        .create(EntityKind::Document, object(json!({"title": "Pour schedule"})))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;

    assert!(a.api.delete(EntityKind::Document, &created.id).await.unwrap());
    a.sync().await;

    b.network.set_online(false);
    b.api
        .update(
            EntityKind::Document,
            &created.id,
            object(json!({"title": "Pour schedule rev B"})),
        )
        .await
        .unwrap();
    b.network.set_online(true);
    let report = b.sync().await;
    assert_eq!(report.conflicts, 1);

    let conflict = b.store.conflicts(false).await.unwrap().remove(0);
    assert!(conflict.server_data.is_none());
    assert_eq!(conflict.server_version, Some(2));

    // The tombstone is not re-applied while the conflict is open.
    assert_eq!(b.sync().await.pulled, 0);
    assert_eq!(b.store.counts().await.unwrap().open_conflicts, 1);

    b.engine
        .resolve_conflict(conflict.id, Resolution::Local)
        .await
        .unwrap();
    let report = b.sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(report.conflicts, 0);

    let restored = server
        .record(EntityKind::Document, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.fields["title"], "Pour schedule rev B");
    assert_eq!(restored.version, 3);

    let local = b
        .store
        .get(EntityKind::Document, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.remote_version, Some(3));
    assert_eq!(b.store.counts().await.unwrap().open_conflicts, 0);
    assert_eq!(b.sync().await.pulled, 0);

    // The deleting client picks the record up again.
    a.sync().await;
    assert!(a
        .store
        .get(EntityKind::Document, &created.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_full_resync_drops_records_deleted_remotely() {
    let (server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let kept = a
        .api
        .create(EntityKind::Equipment, object(json!({"name": "Crane 4"})))
        .await
        .unwrap();
    let removed = a
        .api
        .create(EntityKind::Equipment, object(json!({"name": "Mixer 2"})))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;

    assert!(a.api.delete(EntityKind::Equipment, &removed.id).await.unwrap());
    a.sync().await;

    let report = match b.engine.trigger_sync(SyncTrigger::ForcedFull).await {
        SyncOutcome::Completed(report) => report,
        other => panic!("full resync did not complete: {other:?}"),
    };
    assert!(report.full_resync);
    assert_eq!(report.pulled, 1);
    assert!(b
        .store
        .get(EntityKind::Equipment, &removed.id)
        .await
        .unwrap()
        .is_none());
    assert!(b
        .store
        .get(EntityKind::Equipment, &kept.id)
        .await
        .unwrap()
        .is_some());

    // A fresh client skips tombstones in the snapshot.
    let fresh = Client::new(Arc::new(InProcessTransport::new(server.clone())), true).await;
    assert_eq!(fresh.sync().await.pulled, 1);
    assert_eq!(server.live_count(EntityKind::Equipment).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn redelivered_tombstones_are_not_counted_again() {
    let (_server, transport) = authority(AuthorityConfig::default()).await;
    let a = Client::new(transport.clone(), true).await;
    let b = Client::new(transport, true).await;

    let created = a
        .api
        .create(EntityKind::Warehouse, object(json!({"name": "Yard 3"})))
        .await
        .unwrap();
    a.sync().await;
    b.sync().await;

    assert!(a.api.delete(EntityKind::Warehouse, &created.id).await.unwrap());
    a.sync().await;
    assert_eq!(b.sync().await.pulled, 1);
    assert_eq!(b.sync().await.pulled, 0);
    assert_eq!(a.sync().await.pulled, 0);
}
