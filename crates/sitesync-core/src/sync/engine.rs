//! Sync engine: version check, batched push, pull, conflict handling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::db::keys;
use crate::error::{Error, Result};
use crate::models::{
    ActionId, ActionStatus, ActionType, EntityId, EntityKind, OutboxAction, Resolution,
    SyncErrorRecord, SyncPhase, SyncState,
};
use crate::network::NetworkMonitor;
use crate::services::{delete_base_version, LocalStore};
use crate::util::now;
use crate::version::{MigrationRegistry, VersionManager};

use super::conflict::{auto_resolve, merge, Verdict};
use super::protocol::{
    checksum, BatchOperation, BatchPriority, BatchRequest, BatchResponse, ChangeType,
    ConflictedOperation, RemoteChange, ServerRecord,
};
use super::retry::RetryPolicy;
use super::transport::SyncTransport;

const EVENT_CAPACITY: usize = 64;
const PUSH_PROGRESS_SPAN: usize = 35;

/// What asked for a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTrigger {
    Periodic,
    Reconnect,
    Manual,
    LocalChange,
    Refresh,
    /// Full pull regardless of the stored cursor
    ForcedFull,
}

impl SyncTrigger {
    /// Manual triggers bypass a migration block.
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Manual | Self::ForcedFull)
    }
}

/// Why a trigger did not start a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    /// A data migration failed; only a manual trigger re-attempts it
    MigrationBlocked,
}

/// Totals for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub auto_resolved: usize,
    pub failed: usize,
    pub full_resync: bool,
}

/// Result of `SyncEngine::trigger_sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    Failed(SyncErrorRecord),
}

/// Notifications for observers of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    CycleStarted(SyncTrigger),
    Progress { phase: SyncPhase, progress: u8 },
    ConflictDetected {
        conflict_id: i64,
        entity: EntityKind,
        entity_id: EntityId,
    },
    ConflictResolved {
        conflict_id: i64,
        resolution: Resolution,
    },
    CycleCompleted(SyncReport),
    CycleFailed(SyncErrorRecord),
}

struct EngineInner {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    network: NetworkMonitor,
    config: SyncConfig,
    versions: VersionManager,
    retry: RetryPolicy,
    syncing: AtomicBool,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    triggers: mpsc::Sender<SyncTrigger>,
    trigger_rx: StdMutex<Option<mpsc::Receiver<SyncTrigger>>>,
}

/// Drives push/pull cycles between the local store and the authority.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Background loop started by [`SyncEngine::start`]
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Stop the loop; an in-flight cycle finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!("Sync worker ended abnormally: {error}");
        }
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        network: NetworkMonitor,
        config: SyncConfig,
    ) -> Self {
        Self::with_registry(
            store,
            transport,
            network,
            config,
            MigrationRegistry::with_builtins(),
        )
    }

    pub fn with_registry(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        network: NetworkMonitor,
        config: SyncConfig,
        registry: MigrationRegistry,
    ) -> Self {
        let (state, _) = watch::channel(SyncState {
            is_online: network.is_online(),
            ..SyncState::default()
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (triggers, trigger_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(EngineInner {
                versions: VersionManager::new(store.clone(), registry),
                retry: RetryPolicy::from_config(&config),
                store,
                transport,
                network,
                config,
                syncing: AtomicBool::new(false),
                state,
                events,
                triggers,
                trigger_rx: StdMutex::new(Some(trigger_rx)),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn versions(&self) -> &VersionManager {
        &self.inner.versions
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a cycle for the worker without waiting. Requests made while one
    /// is already queued are coalesced into it.
    pub fn request_sync(&self, trigger: SyncTrigger) {
        match self.inner.triggers.try_send(trigger) {
            Ok(()) => tracing::debug!(?trigger, "Sync requested"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(?trigger, "Sync already queued; coalescing");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(?trigger, "Sync worker stopped; dropping request");
            }
        }
    }

    /// Run one cycle now. Never fails: errors land in the state's error list.
    pub async fn trigger_sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let online = self.inner.network.is_online();
        self.inner.state.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            changed
        });
        if !online {
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        match self.migration_blocked().await {
            Ok(true) if !trigger.is_manual() => {
                tracing::debug!(?trigger, "Sync blocked by failed migration");
                return SyncOutcome::Skipped(SkipReason::MigrationBlocked);
            }
            Ok(_) => {}
            Err(error) => return SyncOutcome::Failed(self.record_error(&error, None)),
        }

        if self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        }

        tracing::info!(?trigger, "Sync cycle started");
        self.inner.state.send_modify(|state| {
            state.is_syncing = true;
            state.sync_progress = 0;
        });
        self.emit(SyncEvent::CycleStarted(trigger));

        let result = self.run_cycle(trigger).await;
        let outcome = match result {
            Ok(report) => {
                tracing::info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    full_resync = report.full_resync,
                    "Sync cycle completed"
                );
                self.emit(SyncEvent::CycleCompleted(report.clone()));
                SyncOutcome::Completed(report)
            }
            Err(error) => {
                tracing::warn!("Sync cycle failed: {error}");
                if let Err(revert) = self.inner.store.revert_syncing_actions().await {
                    tracing::warn!("Could not revert in-flight outbox entries: {revert}");
                }
                let record = self.record_error(&error, None);
                self.emit(SyncEvent::CycleFailed(record.clone()));
                SyncOutcome::Failed(record)
            }
        };

        self.inner.state.send_modify(|state| {
            state.is_syncing = false;
            state.phase = SyncPhase::Idle;
            state.sync_progress = 0;
        });
        self.inner.syncing.store(false, Ordering::SeqCst);
        self.refresh_counts().await;
        outcome
    }

    /// Settle a manual conflict and request a sync to push the outcome.
    pub async fn resolve_conflict(&self, conflict_id: i64, resolution: Resolution) -> Result<()> {
        let store = &self.inner.store;
        let conflict = store
            .conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.resolved {
            return Err(Error::InvalidInput(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let kind = conflict.entity;
        let current = store.get(kind, &conflict.entity_id).await?;
        let build = |action_type: ActionType, id: &EntityId, data| {
            OutboxAction::new(action_type, kind, id.clone(), data, now())
        };

        match resolution {
            Resolution::Server => store.resolve_with_server(&conflict).await?,
            Resolution::Local => {
                let data = current
                    .or_else(|| conflict.local_data.clone())
                    .map(|entity| entity.data)
                    .unwrap_or_default();
                store
                    .resolve_with_data(&conflict, resolution, data, build)
                    .await?;
            }
            Resolution::Merge => {
                let local = current.or_else(|| conflict.local_data.clone());
                let data = merge(local.as_ref(), conflict.server_data.as_ref());
                store
                    .resolve_with_data(&conflict, resolution, data, build)
                    .await?;
            }
        }

        tracing::info!(
            conflict_id,
            entity = %kind,
            entity_id = %conflict.entity_id,
            resolution = %resolution.as_str(),
            "Resolved conflict"
        );
        self.emit(SyncEvent::ConflictResolved {
            conflict_id,
            resolution,
        });
        self.refresh_counts().await;
        self.request_sync(SyncTrigger::Manual);
        Ok(())
    }

    /// Return failed outbox entries to pending with a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<usize> {
        let reset = self.inner.store.reset_failed_actions().await?;
        if reset > 0 {
            tracing::info!(count = reset, "Re-queued failed outbox entries");
            self.request_sync(SyncTrigger::Manual);
        }
        self.refresh_counts().await;
        Ok(reset)
    }

    /// Reload counters and the last sync time from the store into the state.
    pub async fn refresh_counts(&self) {
        let counts = match self.inner.store.counts().await {
            Ok(counts) => counts,
            Err(error) => {
                tracing::warn!("Could not refresh sync counters: {error}");
                return;
            }
        };
        let last_sync_time = self
            .inner
            .store
            .state_time(keys::LAST_SYNC_TIME)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!("Could not read last sync time: {error}");
                None
            });
        self.inner.state.send_modify(|state| {
            state.pending_actions = counts.pending_actions;
            state.failed_actions = counts.failed_actions;
            state.conflict_count = counts.open_conflicts;
            if last_sync_time.is_some() {
                state.last_sync_time = last_sync_time;
            }
        });
    }

    /// Spawn the periodic loop, trigger consumer, and reconnect wiring.
    pub fn start(&self) -> Result<SyncWorker> {
        let mut triggers = self
            .inner
            .trigger_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| Error::InvalidInput("sync worker already started".to_string()))?;

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        self.inner.network.on_reconnect(move || {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.request_sync(SyncTrigger::Reconnect);
            }
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut online = self.inner.network.subscribe();
        let engine = self.clone();
        let interval = self.inner.config.sync_interval;

        let handle = tokio::spawn(async move {
            match engine.inner.store.revert_syncing_actions().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Recovered interrupted outbox entries"),
                Err(error) => tracing::warn!("Could not recover outbox entries: {error}"),
            }
            engine.refresh_counts().await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        engine.trigger_sync(SyncTrigger::Periodic).await;
                    }
                    Some(trigger) = triggers.recv() => {
                        engine.trigger_sync(trigger).await;
                    }
                    Ok(()) = online.changed() => {
                        let is_online = *online.borrow_and_update();
                        engine.inner.state.send_modify(|state| state.is_online = is_online);
                    }
                }
            }
            tracing::debug!("Sync worker stopped");
        });

        Ok(SyncWorker { shutdown, handle })
    }

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    async fn run_cycle(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        self.enter(SyncPhase::CheckingVersion);
        report.full_resync = self.check_version(trigger).await?;

        self.enter(SyncPhase::Pushing);
        self.push(&mut report).await?;

        self.enter(SyncPhase::Pulling);
        let cursor = self.pull(&mut report).await?;

        self.enter(SyncPhase::Resolving);
        let pruned = self
            .inner
            .store
            .prune_conflicts(self.inner.config.conflict_retention)
            .await?;
        if pruned > 0 {
            tracing::debug!(count = pruned, "Pruned resolved conflicts");
        }

        let finished = now();
        self.inner.store.checkpoint(finished, cursor).await?;
        self.inner
            .state
            .send_modify(|state| state.last_sync_time = Some(finished));
        self.advance(100);
        Ok(report)
    }

    /// Returns whether the cycle must pull everything from scratch.
    async fn check_version(&self, trigger: SyncTrigger) -> Result<bool> {
        let store = &self.inner.store;
        let versions = &self.inner.versions;
        let comparison = versions
            .check_for_updates(self.inner.transport.as_ref())
            .await?;

        let mut full = trigger == SyncTrigger::ForcedFull;
        if comparison.update_available || comparison.requires_data_migration {
            match versions.handle_app_update(&comparison).await {
                Ok(resync) => full |= resync,
                Err(error) => {
                    store
                        .set_state_value(keys::MIGRATION_BLOCKED, &error.to_string())
                        .await?;
                    return Err(error);
                }
            }
        }
        store.clear_state_value(keys::MIGRATION_BLOCKED).await?;

        if full {
            tracing::info!("Full resync required; clearing pull cursor");
            store.clear_state_value(keys::PULL_CURSOR).await?;
        }
        Ok(full)
    }

    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        let store = &self.inner.store;
        let batch_size = self.inner.config.batch_size.max(1);
        let client_id = store.client_id().await?;

        let total = store.pushable_actions().await?.len();
        let mut attempted: HashSet<ActionId> = HashSet::new();

        loop {
            if !self.inner.network.is_online() {
                tracing::info!("Went offline; leaving remaining outbox entries queued");
                break;
            }

            // Reload each round: acknowledgements can re-key queued entries.
            let batch: Vec<OutboxAction> = store
                .pushable_actions()
                .await?
                .into_iter()
                .filter(|action| !attempted.contains(&action.id))
                .take(batch_size)
                .collect();
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|action| action.id.clone()));

            self.push_batch(&client_id, batch, report).await?;

            let done = attempted.len().min(total.max(1));
            let span = PUSH_PROGRESS_SPAN * done / total.max(1);
            self.advance(SyncPhase::Pushing.progress() + u8::try_from(span).unwrap_or(0));
        }
        Ok(())
    }

    async fn push_batch(
        &self,
        client_id: &str,
        actions: Vec<OutboxAction>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let store = &self.inner.store;
        let ids: Vec<ActionId> = actions.iter().map(|action| action.id.clone()).collect();

        let mut operations = Vec::with_capacity(actions.len());
        for action in &actions {
            operations.push(self.to_operation(action).await?);
        }
        let mut request = BatchRequest {
            id: uuid::Uuid::now_v7().to_string(),
            client_id: client_id.to_string(),
            operations,
            timestamp: now(),
            priority: BatchPriority::Normal,
            retry_count: 0,
            status: ActionStatus::Syncing,
        };

        store
            .set_action_status(&ids, ActionStatus::Syncing, None)
            .await?;
        tracing::debug!(batch_id = %request.id, size = ids.len(), "Pushing batch");

        let mut attempts = 0;
        let response = loop {
            match self.inner.transport.push_batch(&request).await {
                Ok(response) => break response,
                Err(error) if error.is_transient() => {
                    attempts += 1;
                    store.increment_retries(&ids).await?;
                    if !self.inner.retry.should_retry(attempts) {
                        let message = error.to_string();
                        store
                            .set_action_status(&ids, ActionStatus::Failed, Some(&message))
                            .await?;
                        report.failed += ids.len();
                        return Err(error);
                    }
                    let delay = self.inner.retry.delay(attempts);
                    tracing::warn!(
                        batch_id = %request.id,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Batch push failed: {error}; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    request.retry_count = attempts;
                }
                Err(error) => {
                    // Rejected as a whole; resending the same payload cannot help.
                    let message = error.to_string();
                    store
                        .set_action_status(&ids, ActionStatus::Failed, Some(&message))
                        .await?;
                    report.failed += ids.len();
                    self.record_error(&error, None);
                    return Ok(());
                }
            }
        };

        self.apply_response(actions, response, report).await
    }

    async fn to_operation(&self, action: &OutboxAction) -> Result<BatchOperation> {
        let base_version = match action.action_type {
            ActionType::Create => None,
            ActionType::Update => self
                .inner
                .store
                .get(action.entity, &action.entity_id)
                .await?
                .and_then(|entity| entity.remote_version),
            ActionType::Delete => delete_base_version(action),
        };
        Ok(BatchOperation {
            id: action.id.to_string(),
            op_type: action.action_type,
            entity: action.entity,
            entity_id: Some(action.entity_id.clone()),
            checksum: checksum(&action.data),
            data: action.data.clone(),
            local_timestamp: action.timestamp,
            base_version,
        })
    }

    async fn apply_response(
        &self,
        actions: Vec<OutboxAction>,
        response: BatchResponse,
        report: &mut SyncReport,
    ) -> Result<()> {
        let store = &self.inner.store;
        let mut by_id: HashMap<String, OutboxAction> = actions
            .into_iter()
            .map(|action| (action.id.to_string(), action))
            .collect();

        for success in response.successful {
            let Some(action) = by_id.remove(&success.operation_id) else {
                continue;
            };
            let local_id = self.current_id(action.entity, &action.entity_id).await?;
            store
                .apply_ack(
                    action.entity,
                    &local_id,
                    &action.id,
                    success.server_data.as_ref(),
                )
                .await?;
            report.pushed += 1;
        }

        for conflict in response.conflicts {
            let Some(action) = by_id.remove(&conflict.operation_id) else {
                continue;
            };
            store
                .set_action_status(
                    std::slice::from_ref(&action.id),
                    ActionStatus::Pending,
                    None,
                )
                .await?;
            self.handle_push_conflict(&action, &conflict, report).await?;
        }

        for failed in response.errors {
            let Some(action) = by_id.remove(&failed.operation_id) else {
                continue;
            };
            store
                .set_action_status(
                    std::slice::from_ref(&action.id),
                    ActionStatus::Failed,
                    Some(&failed.error),
                )
                .await?;
            report.failed += 1;
            self.record_error(
                &Error::Validation(failed.error.clone()),
                Some(action.id.clone()),
            );
        }

        let missing: Vec<ActionId> = by_id.into_values().map(|action| action.id).collect();
        if !missing.is_empty() {
            tracing::warn!(
                count = missing.len(),
                "Operations missing from batch response; re-queueing"
            );
            store
                .set_action_status(&missing, ActionStatus::Pending, None)
                .await?;
        }
        Ok(())
    }

    async fn handle_push_conflict(
        &self,
        action: &OutboxAction,
        conflict: &ConflictedOperation,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local_id = self.current_id(action.entity, &action.entity_id).await?;
        tracing::warn!(
            entity = %action.entity,
            entity_id = %local_id,
            reason = %conflict.reason,
            "Push conflicted"
        );
        self.settle_divergence(
            action.entity,
            &local_id,
            conflict.server_data.as_ref(),
            conflict.server_version,
            report,
        )
        .await
    }

    /// Returns the new pull cursor.
    async fn pull(&self, report: &mut SyncReport) -> Result<Option<DateTime<Utc>>> {
        let store = &self.inner.store;
        let since = store.state_time(keys::PULL_CURSOR).await?;
        let changes = self.inner.transport.pull_changes(since).await?;
        tracing::debug!(count = changes.len(), full = since.is_none(), "Pulled changes");

        let mut cursor = since;
        for change in changes {
            cursor = cursor.max(Some(change.changed_at));
            if self.apply_change(&change, report).await? {
                report.pulled += 1;
            }
        }
        Ok(cursor)
    }

    /// Returns `false` for changes this client already has.
    async fn apply_change(&self, change: &RemoteChange, report: &mut SyncReport) -> Result<bool> {
        let store = &self.inner.store;
        let kind = change.entity;
        let id = self.current_id(kind, &change.entity_id).await?;

        let local = store.get(kind, &id).await?;
        if local
            .as_ref()
            .and_then(|entity| entity.remote_version)
            .is_some_and(|version| change.version <= version)
        {
            return Ok(false);
        }

        let open_conflict = store.open_conflict_for(kind, &id).await?;
        if open_conflict
            .as_ref()
            .and_then(|conflict| conflict.server_version)
            .is_some_and(|version| change.version <= version)
        {
            return Ok(false);
        }

        let server = match change.change_type {
            ChangeType::Delete => None,
            ChangeType::Create | ChangeType::Update => change.data.as_ref(),
        };
        let has_pending =
            open_conflict.is_some() || !store.actions_for(kind, &id).await?.is_empty();

        if has_pending {
            self.settle_divergence(kind, &id, server, Some(change.version), report)
                .await?;
            return Ok(true);
        }
        match server {
            Some(record) => {
                store.adopt_server(kind, record).await?;
                Ok(true)
            }
            // `false` when already gone locally (re-delivered tombstone).
            None => store.remove_local(kind, &id).await,
        }
    }

    /// Apply the auto-resolution heuristics, recording a conflict when they
    /// cannot decide.
    async fn settle_divergence(
        &self,
        kind: EntityKind,
        id: &EntityId,
        server: Option<&ServerRecord>,
        server_version: Option<i64>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let store = &self.inner.store;
        let local = store.get(kind, id).await?;
        match auto_resolve(local.as_ref(), server) {
            Verdict::Auto(resolution) => {
                tracing::info!(
                    entity = %kind,
                    entity_id = %id,
                    resolution = %resolution.as_str(),
                    "Auto-resolved divergence"
                );
                store.accept_server(kind, id, server).await?;
                report.auto_resolved += 1;
            }
            Verdict::Manual => {
                let existing = store.open_conflict_for(kind, id).await?;
                let conflict_id = store
                    .record_conflict(kind, id, server, server_version)
                    .await?;
                if existing.is_none() {
                    report.conflicts += 1;
                    self.emit(SyncEvent::ConflictDetected {
                        conflict_id,
                        entity: kind,
                        entity_id: id.clone(),
                    });
                }
                self.inner.state.send_modify(|state| {
                    state.conflict_count += usize::from(existing.is_none());
                });
            }
        }
        Ok(())
    }

    async fn current_id(&self, kind: EntityKind, id: &EntityId) -> Result<EntityId> {
        Ok(self
            .inner
            .store
            .mapped_id(kind, id)
            .await?
            .unwrap_or_else(|| id.clone()))
    }

    async fn migration_blocked(&self) -> Result<bool> {
        Ok(self
            .inner
            .store
            .state_value(keys::MIGRATION_BLOCKED)
            .await?
            .is_some())
    }

    // ------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------

    fn enter(&self, phase: SyncPhase) {
        self.inner.state.send_modify(|state| state.phase = phase);
        self.advance(phase.progress());
    }

    /// Raise progress; never lowers it within a cycle.
    fn advance(&self, progress: u8) {
        let progress = progress.min(100);
        let mut phase = SyncPhase::Idle;
        let raised = self.inner.state.send_if_modified(|state| {
            phase = state.phase;
            if progress > state.sync_progress {
                state.sync_progress = progress;
                true
            } else {
                false
            }
        });
        if raised {
            self.emit(SyncEvent::Progress { phase, progress });
        }
    }

    fn record_error(&self, error: &Error, action_id: Option<ActionId>) -> SyncErrorRecord {
        let record = SyncErrorRecord {
            kind: error.sync_kind(),
            message: error.to_string(),
            action_id,
            at: now(),
        };
        let max_errors = self.inner.config.max_errors;
        self.inner
            .state
            .send_modify(|state| state.push_error(record.clone(), max_errors));
        record
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}
