use chrono::Utc;
use sitesync_core::models::{ActionStatus, OutboxAction};
use sitesync_core::OfflineApi;

use crate::commands::common::format_relative_time;
use crate::error::CliError;

pub async fn run_outbox_list(
    api: &OfflineApi,
    status: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let status = status
        .map(|value| value.trim().parse::<ActionStatus>())
        .transpose()?;
    let actions = api.outbox(status).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }

    if actions.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    for line in format_action_lines(&actions) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_outbox_retry(api: &OfflineApi) -> Result<(), CliError> {
    let reset = api.store().reset_failed_actions().await?;
    println!("{reset} failed action(s) queued again");
    Ok(())
}

pub fn format_action_lines(actions: &[OutboxAction]) -> Vec<String> {
    let now = Utc::now();
    actions
        .iter()
        .map(|action| {
            let mut line = format!(
                "{:<8}  {:<6} {:<32}  retries={}  {}",
                action.status.as_str(),
                action.method,
                action.url,
                action.retry_count,
                format_relative_time(action.timestamp, now)
            );
            if let Some(error) = action.error.as_deref() {
                line.push_str("  error=");
                line.push_str(error);
            }
            line
        })
        .collect()
}
