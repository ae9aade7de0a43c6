//! sitesync CLI - offline-first records with background sync
//!
//! Every command works against the local database; `sync`, `watch` and
//! conflict resolution talk to the server when one is configured.

mod cli;
mod commands;
mod error;


use std::time::Duration;

use clap::Parser;
use sitesync_core::OfflineApi;

use crate::cli::{Cli, Commands, ConflictCommands, OutboxCommands};
use crate::commands::common::{open_store, resolve_db_path, sync_config};
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::outbox::{run_outbox_list, run_outbox_retry};
use crate::commands::records::{
    run_add, run_delete, run_list, run_show, run_update, ListArgs,
};
use crate::commands::seed::run_seed;
use crate::commands::sync::{run_status, run_sync, run_watch};
use crate::commands::version::run_version;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["sitesync=info", "sitesync_core=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config = sync_config(cli.server_url)?;
    let store = open_store(&db_path).await?;
    let api = OfflineApi::new(store.clone());

    match cli.command {
        Commands::Add { kind, fields, json } => {
            run_add(&api, &kind, &fields, json.as_deref()).await?;
        }
        Commands::List {
            kind,
            company,
            project,
            status,
            sync_status,
            limit,
            json,
        } => {
            let args = ListArgs {
                kind: &kind,
                company,
                project,
                status,
                sync_status: sync_status.as_deref(),
                limit,
                as_json: json,
            };
            run_list(&api, args).await?;
        }
        Commands::Show { kind, id } => run_show(&api, &kind, &id).await?,
        Commands::Update {
            kind,
            id,
            fields,
            json,
        } => run_update(&api, &kind, &id, &fields, json.as_deref()).await?,
        Commands::Delete { kind, id } => run_delete(&api, &kind, &id).await?,
        Commands::Seed => run_seed(&api).await?,
        Commands::Status { json } => run_status(&store, &config, json).await?,
        Commands::Sync { full } => run_sync(store, config, full).await?,
        Commands::Watch { probe_interval } => {
            run_watch(store, config, Duration::from_secs(probe_interval.max(1))).await?;
        }
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { all, json } => {
                run_conflicts_list(&store, all, json).await?;
            }
            ConflictCommands::Resolve { id, strategy } => {
                run_conflicts_resolve(store, config, id, &strategy).await?;
            }
        },
        Commands::Outbox { command } => match command {
            OutboxCommands::List { status, json } => {
                run_outbox_list(&api, status.as_deref(), json).await?;
            }
            OutboxCommands::Retry => run_outbox_retry(&api).await?,
        },
        Commands::Version { json } => run_version(store, config, json).await?,
    }

    Ok(())
}
