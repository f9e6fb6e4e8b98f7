//! `callforge call`: place an outbound call through a running gateway.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use callforge_core::{CallMode, is_e164};

use crate::terminal_output::{note_error, note_success};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<CallMode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlResponse {
    success: bool,
    call_id: Option<String>,
    error: Option<String>,
}

pub async fn run(base_url: &str, request: CallRequest) -> Result<()> {
    if !is_e164(&request.to) {
        bail!("`{}` is not an E.164 number (expected e.g. +15551234567)", request.to);
    }
    let resp = reqwest::Client::new()
        .post(format!("{base_url}/api/calls"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("callforge is not reachable at {base_url}; start it with `callforge serve`"))?;
    let body: ControlResponse = resp.json().await.context("Unexpected control API response")?;

    if body.success {
        note_success(&format!("Call placed: {}", body.call_id.unwrap_or_default()));
        Ok(())
    } else {
        let reason = body.error.unwrap_or_else(|| "unknown error".to_string());
        note_error(&reason);
        bail!("call was not placed")
    }
}
