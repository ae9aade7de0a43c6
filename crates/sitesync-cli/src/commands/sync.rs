use std::time::Duration;

use serde::Serialize;
use sitesync_core::db::keys;
use sitesync_core::sync::{SkipReason, SyncEvent, SyncOutcome, SyncReport};
use sitesync_core::{LocalStore, SyncConfig, SyncTrigger};

use crate::commands::common::{connect, format_timestamp, SyncContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusItem {
    pub database: String,
    pub client_id: String,
    pub server_url: Option<String>,
    pub pending_actions: usize,
    pub failed_actions: usize,
    pub open_conflicts: usize,
    pub last_sync_time: Option<String>,
    pub migration_blocked: bool,
}

pub async fn status_item(
    store: &LocalStore,
    config: &SyncConfig,
) -> Result<StatusItem, CliError> {
    let counts = store.counts().await?;
    let last_sync_time = store.state_time(keys::LAST_SYNC_TIME).await?;
    let migration_blocked = store.state_value(keys::MIGRATION_BLOCKED).await?.is_some();
    Ok(StatusItem {
        database: store
            .path()
            .map_or_else(|| ":memory:".to_string(), |path| path.display().to_string()),
        client_id: store.client_id().await?,
        server_url: config.server_url.clone(),
        pending_actions: counts.pending_actions,
        failed_actions: counts.failed_actions,
        open_conflicts: counts.open_conflicts,
        last_sync_time: last_sync_time.map(format_timestamp),
        migration_blocked,
    })
}

pub async fn run_status(
    store: &LocalStore,
    config: &SyncConfig,
    as_json: bool,
) -> Result<(), CliError> {
    let status = status_item(store, config).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Database:      {}", status.database);
    println!("Client id:     {}", status.client_id);
    println!(
        "Server:        {}",
        status.server_url.as_deref().unwrap_or("not configured")
    );
    println!("Pending:       {}", status.pending_actions);
    println!("Failed:        {}", status.failed_actions);
    println!("Conflicts:     {}", status.open_conflicts);
    println!(
        "Last sync:     {}",
        status.last_sync_time.as_deref().unwrap_or("never")
    );
    if status.migration_blocked {
        println!("Sync is blocked by a failed data migration; run `sitesync sync` to retry.");
    }
    Ok(())
}

pub async fn run_sync(store: LocalStore, config: SyncConfig, full: bool) -> Result<(), CliError> {
    let SyncContext { engine, .. } = connect(store, config).await?;
    let trigger = if full {
        SyncTrigger::ForcedFull
    } else {
        SyncTrigger::Manual
    };

    match engine.trigger_sync(trigger).await {
        SyncOutcome::Completed(report) => {
            println!("{}", format_report(&report));
            Ok(())
        }
        SyncOutcome::Skipped(reason) => Err(CliError::SyncSkipped(skip_message(reason).to_string())),
        SyncOutcome::Failed(error) => Err(CliError::SyncFailed(error.message)),
    }
}

const fn skip_message(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Offline => "the sync server is unreachable",
        SkipReason::AlreadySyncing => "another sync is in progress",
        SkipReason::MigrationBlocked => "a data migration failed",
    }
}

pub fn format_report(report: &SyncReport) -> String {
    let mut line = format!(
        "Sync completed: {} pushed, {} pulled, {} conflicts, {} auto-resolved, {} failed",
        report.pushed, report.pulled, report.conflicts, report.auto_resolved, report.failed
    );
    if report.full_resync {
        line.push_str(" (full resync)");
    }
    line
}

/// Run the background worker with a connectivity probe until Ctrl-C.
pub async fn run_watch(
    store: LocalStore,
    config: SyncConfig,
    probe_interval: Duration,
) -> Result<(), CliError> {
    let SyncContext { engine, transport } = connect(store, config).await?;
    let mut events = engine.subscribe_events();
    let probe = engine.network().spawn_probe(transport, probe_interval);
    let worker = engine.start()?;
    engine.request_sync(SyncTrigger::Manual);
    println!("Watching for changes; press Ctrl-C to stop.");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Dropped sync events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    probe.abort();
    worker.shutdown().await;
    println!("Stopped.");
    Ok(())
}

pub fn describe_event(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::CycleCompleted(report) => Some(format_report(report)),
        SyncEvent::CycleFailed(error) => Some(format!("Sync failed: {}", error.message)),
        SyncEvent::ConflictDetected {
            conflict_id,
            entity,
            entity_id,
        } => Some(format!(
            "Conflict #{conflict_id} on {entity}/{entity_id}; run `sitesync conflicts resolve {conflict_id} <local|server|merge>`"
        )),
        SyncEvent::ConflictResolved {
            conflict_id,
            resolution,
        } => Some(format!(
            "Conflict #{conflict_id} resolved with {}",
            resolution.as_str()
        )),
        SyncEvent::CycleStarted(_) | SyncEvent::Progress { .. } => None,
    }
}
