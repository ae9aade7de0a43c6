use sitesync_core::models::Resolution;
use sitesync_core::{LocalStore, SyncConfig, SyncTrigger};

use crate::commands::common::{connect, format_conflict_lines};
use crate::error::CliError;

pub async fn run_conflicts_list(
    store: &LocalStore,
    include_resolved: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = store.conflicts(include_resolved).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

/// Settle a conflict, then push the outcome when the server is reachable.
pub async fn run_conflicts_resolve(
    store: LocalStore,
    config: SyncConfig,
    conflict_id: i64,
    strategy: &str,
) -> Result<(), CliError> {
    let resolution = strategy.parse::<Resolution>()?;

    let context = connect(store, config).await?;
    context
        .engine
        .resolve_conflict(conflict_id, resolution)
        .await?;
    println!("Conflict #{conflict_id} resolved with {}", resolution.as_str());

    if context.engine.network().is_online() {
        let outcome = context
            .engine
            .trigger_sync(SyncTrigger::Manual)
            .await;
        tracing::debug!(?outcome, "Post-resolution sync finished");
    }
    Ok(())
}
