use chrono::Utc;
use sitesync_core::models::SyncStatus;
use sitesync_core::{EntityFilter, EntityId, OfflineApi};

use crate::commands::common::{format_entity_lines, parse_fields, parse_kind};
use crate::error::CliError;

pub struct ListArgs<'a> {
    pub kind: &'a str,
    pub company: Option<String>,
    pub project: Option<String>,
    pub status: Option<String>,
    pub sync_status: Option<&'a str>,
    pub limit: usize,
    pub as_json: bool,
}

pub async fn run_add(
    api: &OfflineApi,
    kind: &str,
    pairs: &[String],
    json: Option<&str>,
) -> Result<(), CliError> {
    let kind = parse_kind(kind)?;
    let fields = parse_fields(pairs, json)?;
    let entity = api.create(kind, fields).await?;
    println!("{}", entity.id);
    Ok(())
}

pub async fn run_list(api: &OfflineApi, args: ListArgs<'_>) -> Result<(), CliError> {
    let kind = parse_kind(args.kind)?;
    let mut filter = EntityFilter::new().limit(args.limit);
    if let Some(company) = args.company {
        filter = filter.company(company);
    }
    if let Some(project) = args.project {
        filter = filter.project(project);
    }
    if let Some(status) = args.status {
        filter = filter.status(status);
    }
    if let Some(sync_status) = args.sync_status {
        filter = filter.sync_status(sync_status.trim().parse::<SyncStatus>()?);
    }

    let mut cursor = api.query(kind, &filter).await?;
    let mut entities = Vec::new();
    while let Some(entity) = cursor.next().await? {
        entities.push(entity);
    }

    if args.as_json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
    } else if entities.is_empty() {
        println!("No {kind} records.");
    } else {
        for line in format_entity_lines(&entities, Utc::now()) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_show(api: &OfflineApi, kind: &str, id: &str) -> Result<(), CliError> {
    let kind = parse_kind(kind)?;
    let id = parse_id(id)?;
    let entity = api
        .get(kind, &id)
        .await?
        .ok_or_else(|| CliError::RecordNotFound(format!("{kind} {id}")))?;
    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}

pub async fn run_update(
    api: &OfflineApi,
    kind: &str,
    id: &str,
    pairs: &[String],
    json: Option<&str>,
) -> Result<(), CliError> {
    let kind = parse_kind(kind)?;
    let id = parse_id(id)?;
    let patch = parse_fields(pairs, json)?;
    let entity = api.update(kind, &id, patch).await?;
    println!("{}", entity.id);
    Ok(())
}

pub async fn run_delete(api: &OfflineApi, kind: &str, id: &str) -> Result<(), CliError> {
    let kind = parse_kind(kind)?;
    let id = parse_id(id)?;
    if !api.delete(kind, &id).await? {
        return Err(CliError::RecordNotFound(format!("{kind} {id}")));
    }
    println!("{id}");
    Ok(())
}

fn parse_id(id: &str) -> Result<EntityId, CliError> {
    Ok(id.parse::<EntityId>()?)
}
