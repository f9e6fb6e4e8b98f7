//! `callforge status`: ask a running gateway for its health and live calls.

use anyhow::{Context, Result};
use serde::Deserialize;

use callforge_core::CallRecord;

use crate::history_cmd;
use crate::terminal_output::{note_success, note_warn, render_table};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    provider: String,
    active_calls: usize,
    uptime_seconds: u64,
}

pub async fn run(base_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let health = match client.get(format!("{base_url}/api/health")).send().await {
        Ok(resp) => resp.json::<Health>().await.context("Unexpected health response")?,
        Err(_) => {
            note_warn(&format!("callforge is not running at {base_url}"));
            return Ok(());
        }
    };
    note_success(&format!(
        "Gateway up for {}s, provider {}, {} active call(s)",
        health.uptime_seconds, health.provider, health.active_calls
    ));

    if health.active_calls == 0 {
        return Ok(());
    }
    let calls: Vec<CallRecord> = client
        .get(format!("{base_url}/api/calls"))
        .send()
        .await?
        .json()
        .await
        .context("Unexpected call list response")?;
    let rows: Vec<Vec<String>> = calls.iter().map(history_cmd::row).collect();
    print!("{}", render_table(&history_cmd::columns(), &rows));
    Ok(())
}
