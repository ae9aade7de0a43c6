use serde::Serialize;
use sitesync_core::models::{AppVersion, UpdateType, VersionComparison};
use sitesync_core::{LocalStore, SyncConfig};

use crate::commands::common::connect;
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionReport {
    current: AppVersion,
    applied_migrations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comparison: Option<VersionComparison>,
}

pub async fn run_version(
    store: LocalStore,
    config: SyncConfig,
    as_json: bool,
) -> Result<(), CliError> {
    let applied_migrations = store.applied_migrations().await?;

    let (current, comparison) = if config.server_url.is_some() {
        let context = connect(store, config).await?;
        let versions = context.engine.versions();
        let current = versions.get_current_version().await?;
        let comparison = if context.engine.network().is_online() {
            Some(versions.check_for_updates(context.transport.as_ref()).await?)
        } else {
            None
        };
        (current, comparison)
    } else {
        (AppVersion::current(), None)
    };

    let report = VersionReport {
        current,
        applied_migrations,
        comparison,
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Local version:  {}", report.current);
    if !report.applied_migrations.is_empty() {
        println!("Migrations:     {}", report.applied_migrations.join(", "));
    }
    match &report.comparison {
        Some(comparison) => {
            println!("Server version: {}", comparison.remote);
            println!("Update:         {}", describe_update(comparison));
            if !comparison.pending_migrations.is_empty() {
                println!(
                    "Pending:        {}",
                    comparison.pending_migrations.join(", ")
                );
            }
        }
        None => println!("Server version: unavailable"),
    }
    Ok(())
}

pub fn describe_update(comparison: &VersionComparison) -> String {
    let label = match comparison.update_type {
        UpdateType::None => return "up to date".to_string(),
        UpdateType::Build => "build",
        UpdateType::Patch => "patch",
        UpdateType::Minor => "minor",
        UpdateType::Major => "major",
    };
    if comparison.breaking {
        format!("{label} (breaking, full resync on next sync)")
    } else {
        label.to_string()
    }
}
