//! Plivo Voice.
//!
//! Placing a call yields only a `request_uuid`; the real `CallUUID` shows
//! up on the first webhook. Until then instructions are parked under the
//! request id and the answer webhook moves them over. Mid-call speech and
//! listening are delivered by transferring the live call to an XML flow.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use callforge_core::{
    CallDirection, CallEvent, CallEventKind, EndReason, HangupCallInput, InitiateCallInput,
    InitiateCallResult, PlayTtsInput, ProviderAdapter, ProviderCallStatus, ProviderKind,
    StartListeningInput, StopListeningInput, WebhookContext, WebhookParseResult,
    WebhookVerification,
};
use callforge_security::{form_params, verify_plivo_webhook};

use crate::markup::{element, flow_url, response, text_element};
use crate::pending::PendingInstructions;
use crate::{check_status, non_empty};

pub const PLIVO_API_BASE: &str = "https://api.plivo.com/v1";

const HOLD_SECS: &str = "30";

#[derive(Debug, Clone)]
pub struct PlivoOptions {
    pub auth_id: String,
    pub auth_token: String,
    pub webhook_url: Option<String>,
    pub public_url: Option<String>,
    pub skip_verification: bool,
    pub ring_timeout_secs: u64,
    pub voice: String,
    pub language: String,
    pub base_url: String,
}

impl PlivoOptions {
    pub fn new(auth_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
            auth_token: auth_token.into(),
            webhook_url: None,
            public_url: None,
            skip_verification: false,
            ring_timeout_secs: 30,
            voice: "WOMAN".into(),
            language: "en-US".into(),
            base_url: PLIVO_API_BASE.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CreateCallResponse {
    request_uuid: String,
}

#[derive(Default)]
struct Correlation {
    /// request_uuid -> engine call id
    requests: HashMap<String, String>,
    /// engine call id -> CallUUID
    calls: HashMap<String, String>,
}

pub struct PlivoProvider {
    options: PlivoOptions,
    http: reqwest::Client,
    pending: PendingInstructions,
    correlation: Mutex<Correlation>,
    webhook_url: Mutex<Option<String>>,
}

/// Map Plivo's hangup fields onto an end reason, defaulting to completed.
pub fn map_hangup(call_status: Option<&str>, cause: Option<&str>) -> EndReason {
    match call_status {
        Some("busy") => return EndReason::Busy,
        Some("no-answer") | Some("timeout") => return EndReason::NoAnswer,
        Some("failed") => return EndReason::Failed,
        Some("cancel") => return EndReason::HangupBot,
        _ => {}
    }
    match cause.unwrap_or_default() {
        "Busy Line" => EndReason::Busy,
        "No Answer" | "Ring Timeout Reached" => EndReason::NoAnswer,
        "Rejected" | "Unallocated Number" => EndReason::Failed,
        "Machine Detected" => EndReason::Voicemail,
        _ => EndReason::Completed,
    }
}

impl PlivoProvider {
    pub fn new(options: PlivoOptions) -> Self {
        let webhook_url = Mutex::new(options.webhook_url.clone());
        Self {
            options,
            http: reqwest::Client::new(),
            pending: PendingInstructions::default(),
            correlation: Mutex::new(Correlation::default()),
            webhook_url,
        }
    }

    fn correlation(&self) -> MutexGuard<'_, Correlation> {
        self.correlation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/Account/{}/{}",
            self.options.base_url.trim_end_matches('/'),
            self.options.auth_id,
            path
        )
    }

    fn webhook_base(&self) -> Result<String> {
        self.webhook_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("Plivo webhook URL not known yet"))
    }

    fn speak(&self, text: &str, locale: Option<&str>) -> String {
        let language = locale.unwrap_or(&self.options.language);
        text_element("Speak", &[("voice", self.options.voice.as_str()), ("language", language)], text)
    }

    fn get_input(&self, base: &str, call_id: &str, language: Option<&str>) -> String {
        let action = flow_url(base, "getinput", Some(call_id));
        element(
            "GetInput",
            &[
                ("action", action.as_str()),
                ("method", "POST"),
                ("inputType", "dtmf speech"),
                ("executionTimeout", "30"),
                ("speechEndTimeout", "2"),
                ("language", language.unwrap_or(&self.options.language)),
                ("redirect", "true"),
            ],
            None,
        )
    }

    fn next_instructions(&self, call_uuid: &str, call_id: Option<&str>) -> String {
        let verbs = self.pending.take(call_uuid);
        let Ok(base) = self.webhook_base() else {
            return response(verbs);
        };
        let redirect = element("Redirect", &[("method", "POST")], Some(&flow_url(&base, "xml-listen", call_id)));
        if verbs.is_empty() {
            return response([element("Wait", &[("length", HOLD_SECS)], None), redirect]);
        }
        response(verbs.into_iter().chain(std::iter::once(redirect)))
    }

    /// Resolve the engine call id and move request-scoped state to the
    /// final CallUUID.
    fn correlate(&self, call_id: Option<&str>, request_uuid: Option<&str>, call_uuid: &str) -> Option<String> {
        let mut correlation = self.correlation();
        let call_id = call_id
            .map(str::to_string)
            .or_else(|| request_uuid.and_then(|r| correlation.requests.get(r).cloned()))?;
        if let Some(request_uuid) = request_uuid {
            if correlation.requests.contains_key(request_uuid) {
                self.pending.rekey(request_uuid, call_uuid);
            }
        }
        correlation.calls.insert(call_id.clone(), call_uuid.to_string());
        Some(call_id)
    }

    /// Transfer a live call to an XML flow. Before the CallUUID is known
    /// the answer webhook picks parked instructions up instead.
    async fn transfer(&self, call_id: &str, provider_call_id: &str, flow: &str) -> Result<()> {
        let call_uuid = {
            let correlation = self.correlation();
            match correlation.calls.get(call_id) {
                Some(uuid) => uuid.clone(),
                None if correlation.requests.contains_key(provider_call_id) => {
                    debug!(call_id, "[Plivo] Call not answered yet, instruction parked");
                    return Ok(());
                }
                None => provider_call_id.to_string(),
            }
        };
        let aleg_url = flow_url(&self.webhook_base()?, flow, Some(call_id));
        let resp = self
            .http
            .post(self.account_url(&format!("Call/{call_uuid}/")))
            .basic_auth(&self.options.auth_id, Some(&self.options.auth_token))
            .json(&json!({ "legs": "aleg", "aleg_url": aleg_url, "aleg_method": "POST" }))
            .send()
            .await
            .context("Plivo transfer request failed")?;
        check_status(resp, "Plivo").await?;
        debug!(call_id, flow, "[Plivo] Call transferred");
        Ok(())
    }

    /// Parking key for a call: the CallUUID once known, else whatever id
    /// the engine holds.
    fn parking_key(&self, call_id: &str, provider_call_id: &str) -> String {
        self.correlation()
            .calls
            .get(call_id)
            .cloned()
            .unwrap_or_else(|| provider_call_id.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for PlivoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Plivo
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerification {
        verify_plivo_webhook(
            ctx,
            &self.options.auth_token,
            self.options.skip_verification,
            self.options.public_url.as_deref(),
        )
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> WebhookParseResult {
        let params: HashMap<String, String> = form_params(&ctx.raw_body).into_iter().collect();
        let Some(call_uuid) = non_empty(&params, "CallUUID") else {
            return WebhookParseResult::bad_request("missing CallUUID");
        };
        let flow = ctx.query_param("flow").unwrap_or("answer");
        let request_uuid = non_empty(&params, "RequestUUID");
        let call_id = self.correlate(ctx.query_param("callId"), request_uuid, call_uuid);
        let direction = match non_empty(&params, "Direction") {
            Some("inbound") => Some(CallDirection::Inbound),
            Some("outbound") => Some(CallDirection::Outbound),
            _ => None,
        };
        let from = non_empty(&params, "From").map(str::to_string);
        let to = non_empty(&params, "To").map(str::to_string);
        let tag = |event: CallEvent| {
            event
                .for_call(call_id.clone())
                .for_provider_call(call_uuid)
                .with_parties(direction, from.clone(), to.clone())
        };

        let mut events = Vec::new();
        let body = match flow {
            "ring" => {
                events.push(tag(CallEvent::with_id(format!("{call_uuid}:ringing"), CallEventKind::Ringing)));
                response(Vec::<String>::new())
            }
            "hangup" => {
                let reason = map_hangup(non_empty(&params, "CallStatus"), non_empty(&params, "HangupCauseName"));
                events.push(tag(CallEvent::with_id(format!("{call_uuid}:ended"), CallEventKind::Ended { reason })));
                self.pending.forget(call_uuid);
                if let Some(id) = &call_id {
                    self.correlation().calls.remove(id);
                }
                if let Some(request_uuid) = request_uuid {
                    self.correlation().requests.remove(request_uuid);
                }
                response(Vec::<String>::new())
            }
            "answer" => {
                events.push(tag(CallEvent::with_id(format!("{call_uuid}:answered"), CallEventKind::Answered)));
                self.next_instructions(call_uuid, call_id.as_deref())
            }
            _ => {
                if let Some(digits) = non_empty(&params, "Digits") {
                    events.push(tag(CallEvent::new(CallEventKind::Dtmf { digits: digits.to_string() })));
                } else if let Some(transcript) = non_empty(&params, "Speech") {
                    events.push(tag(CallEvent::new(CallEventKind::Speech {
                        transcript: transcript.to_string(),
                        is_final: true,
                        confidence: non_empty(&params, "SpeechConfidenceScore").and_then(|c| c.parse().ok()),
                    })));
                }
                self.next_instructions(call_uuid, call_id.as_deref())
            }
        };
        WebhookParseResult::xml(events, body)
    }

    async fn initiate_call(&self, input: InitiateCallInput) -> Result<InitiateCallResult> {
        *self.webhook_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(input.webhook_url.clone());
        let hook = |flow: &str| flow_url(&input.webhook_url, flow, Some(&input.call_id));
        let body = json!({
            "from": input.from.trim_start_matches('+'),
            "to": input.to.trim_start_matches('+'),
            "answer_url": hook("answer"),
            "answer_method": "POST",
            "ring_url": hook("ring"),
            "ring_method": "POST",
            "hangup_url": hook("hangup"),
            "hangup_method": "POST",
            "ring_timeout": self.options.ring_timeout_secs,
        });
        let resp = self
            .http
            .post(self.account_url("Call/"))
            .basic_auth(&self.options.auth_id, Some(&self.options.auth_token))
            .json(&body)
            .send()
            .await
            .context("Plivo create-call request failed")?;
        let created: CreateCallResponse = check_status(resp, "Plivo")
            .await?
            .json()
            .await
            .context("Failed to parse Plivo create-call response")?;

        self.correlation()
            .requests
            .insert(created.request_uuid.clone(), input.call_id.clone());
        info!(call_id = %input.call_id, request_uuid = %created.request_uuid, "[Plivo] Call queued");
        Ok(InitiateCallResult {
            provider_call_id: created.request_uuid,
            status: ProviderCallStatus::Queued,
        })
    }

    async fn hangup_call(&self, input: HangupCallInput) -> Result<()> {
        let call_uuid = self.correlation().calls.remove(&input.call_id);
        let path = match &call_uuid {
            Some(uuid) => format!("Call/{uuid}/"),
            None => format!("Request/{}/", input.provider_call_id),
        };
        self.pending.forget(call_uuid.as_deref().unwrap_or(&input.provider_call_id));
        let resp = self
            .http
            .delete(self.account_url(&path))
            .basic_auth(&self.options.auth_id, Some(&self.options.auth_token))
            .send()
            .await
            .context("Plivo hangup request failed")?;
        check_status(resp, "Plivo").await?;
        info!(call_id = %input.call_id, reason = %input.reason, "[Plivo] Call hung up");
        Ok(())
    }

    async fn play_tts(&self, input: PlayTtsInput) -> Result<()> {
        let key = self.parking_key(&input.call_id, &input.provider_call_id);
        self.pending.push_speech(&key, self.speak(&input.text, input.locale.as_deref()));
        self.transfer(&input.call_id, &input.provider_call_id, "xml-speak").await
    }

    async fn start_listening(&self, input: StartListeningInput) -> Result<()> {
        let key = self.parking_key(&input.call_id, &input.provider_call_id);
        let get_input = self.get_input(&self.webhook_base()?, &input.call_id, input.language.as_deref());
        if self.pending.push_listen(&key, get_input) {
            self.transfer(&input.call_id, &input.provider_call_id, "xml-listen").await?;
        }
        Ok(())
    }

    async fn stop_listening(&self, input: StopListeningInput) -> Result<()> {
        let key = self.parking_key(&input.call_id, &input.provider_call_id);
        self.pending.cancel_listen(&key);
        Ok(())
    }

    fn rejection_response(&self) -> Option<WebhookParseResult> {
        Some(WebhookParseResult::xml(
            Vec::new(),
            response([element("Hangup", &[("reason", "rejected")], None)]),
        ))
    }
}
