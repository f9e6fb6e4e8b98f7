//! Telnyx Call Control v2.
//!
//! Telnyx pushes JSON webhooks and accepts REST commands against a
//! `call_control_id`, so no markup is involved. The engine call id rides
//! along base64-encoded in `client_state`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use callforge_core::{
    CallDirection, CallEvent, CallEventKind, EndReason, HangupCallInput, InitiateCallInput,
    InitiateCallResult, PlayTtsInput, ProviderAdapter, ProviderCallStatus, ProviderKind,
    StartListeningInput, StopListeningInput, WebhookContext, WebhookParseResult,
    WebhookVerification,
};
use callforge_security::verify_telnyx_webhook;

use crate::check_status;

pub const TELNYX_API_BASE: &str = "https://api.telnyx.com/v2";

#[derive(Debug, Clone)]
pub struct TelnyxOptions {
    pub api_key: String,
    pub connection_id: String,
    pub public_key: Option<String>,
    pub skip_verification: bool,
    pub ring_timeout_secs: u64,
    pub voice: String,
    pub base_url: String,
}

impl TelnyxOptions {
    pub fn new(api_key: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            connection_id: connection_id.into(),
            public_key: None,
            skip_verification: false,
            ring_timeout_secs: 30,
            voice: "female".into(),
            base_url: TELNYX_API_BASE.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    id: String,
    event_type: String,
    #[serde(default)]
    payload: EventPayload,
}

#[derive(Deserialize, Default)]
struct EventPayload {
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    client_state: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    hangup_cause: Option<String>,
    #[serde(default)]
    digit: Option<String>,
    #[serde(default)]
    transcription_data: Option<TranscriptionData>,
}

#[derive(Deserialize)]
struct TranscriptionData {
    transcript: String,
    #[serde(default = "default_final")]
    is_final: bool,
    #[serde(default)]
    confidence: Option<f32>,
}

fn default_final() -> bool {
    true
}

#[derive(Deserialize)]
struct CreateCallResponse {
    data: CreatedCall,
}

#[derive(Deserialize)]
struct CreatedCall {
    call_control_id: String,
}

/// Map a `hangup_cause` onto an end reason. Unknown causes count as an
/// ordinary completion.
pub fn map_hangup_cause(cause: Option<&str>) -> EndReason {
    match cause.unwrap_or_default() {
        "normal_clearing" => EndReason::Completed,
        "originator_cancel" => EndReason::HangupBot,
        "user_busy" => EndReason::Busy,
        "no_answer" | "timeout" => EndReason::NoAnswer,
        "call_rejected" | "unallocated_number" | "destination_out_of_order" => EndReason::Failed,
        _ => EndReason::Completed,
    }
}

fn encode_client_state(call_id: &str) -> String {
    STANDARD.encode(call_id)
}

fn decode_client_state(state: &str) -> Option<String> {
    let bytes = STANDARD.decode(state).ok()?;
    String::from_utf8(bytes).ok().filter(|s| !s.is_empty())
}

pub struct TelnyxProvider {
    options: TelnyxOptions,
    http: reqwest::Client,
}

impl TelnyxProvider {
    pub fn new(options: TelnyxOptions) -> Self {
        Self { options, http: reqwest::Client::new() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.options.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.options.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Telnyx request to {path} failed"))?;
        check_status(resp, "Telnyx").await
    }

    async fn action(&self, call_control_id: &str, action: &str, body: Value) -> Result<()> {
        self.post(&format!("calls/{call_control_id}/actions/{action}"), body).await?;
        debug!(call_control_id, action, "[Telnyx] Action sent");
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for TelnyxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Telnyx
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerification {
        verify_telnyx_webhook(ctx, self.options.public_key.as_deref(), self.options.skip_verification)
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> WebhookParseResult {
        let envelope: Envelope = match serde_json::from_str(&ctx.raw_body) {
            Ok(e) => e,
            Err(e) => return WebhookParseResult::bad_request(format!("invalid Telnyx payload: {e}")),
        };
        let EventData { id, event_type, payload } = envelope.data;

        let kind = match event_type.as_str() {
            "call.initiated" => CallEventKind::Initiated,
            "call.answered" => CallEventKind::Answered,
            "call.bridged" => CallEventKind::Active,
            "call.speak.started" => CallEventKind::Speaking { text: None },
            "call.transcription" => match payload.transcription_data {
                Some(data) => CallEventKind::Speech {
                    transcript: data.transcript,
                    is_final: data.is_final,
                    confidence: data.confidence,
                },
                None => return WebhookParseResult::events(Vec::new()),
            },
            "call.dtmf.received" => match payload.digit.clone() {
                Some(digits) => CallEventKind::Dtmf { digits },
                None => return WebhookParseResult::events(Vec::new()),
            },
            "call.hangup" => CallEventKind::Ended {
                reason: map_hangup_cause(payload.hangup_cause.as_deref()),
            },
            other => {
                debug!(event_type = other, "[Telnyx] Ignoring event");
                return WebhookParseResult::events(Vec::new());
            }
        };

        let direction = match payload.direction.as_deref() {
            Some("incoming") => Some(CallDirection::Inbound),
            Some("outgoing") => Some(CallDirection::Outbound),
            _ => None,
        };
        let call_id = payload.client_state.as_deref().and_then(decode_client_state);
        let event = CallEvent::with_id(id, kind)
            .for_call(call_id)
            .for_provider_call(payload.call_control_id.unwrap_or_default())
            .with_parties(direction, payload.from, payload.to);
        WebhookParseResult::events(vec![event])
    }

    async fn initiate_call(&self, input: InitiateCallInput) -> Result<InitiateCallResult> {
        let body = json!({
            "connection_id": self.options.connection_id,
            "to": input.to,
            "from": input.from,
            "webhook_url": input.webhook_url,
            "webhook_url_method": "POST",
            "client_state": encode_client_state(&input.call_id),
            "timeout_secs": self.options.ring_timeout_secs,
        });
        let created: CreateCallResponse = self
            .post("calls", body)
            .await?
            .json()
            .await
            .context("Failed to parse Telnyx create-call response")?;
        info!(call_id = %input.call_id, provider_call_id = %created.data.call_control_id, "[Telnyx] Call placed");
        Ok(InitiateCallResult {
            provider_call_id: created.data.call_control_id,
            status: ProviderCallStatus::Initiated,
        })
    }

    async fn hangup_call(&self, input: HangupCallInput) -> Result<()> {
        self.action(&input.provider_call_id, "hangup", json!({})).await?;
        info!(call_id = %input.call_id, reason = %input.reason, "[Telnyx] Call hung up");
        Ok(())
    }

    async fn play_tts(&self, input: PlayTtsInput) -> Result<()> {
        let body = json!({
            "payload": input.text,
            "voice": input.voice.unwrap_or_else(|| self.options.voice.clone()),
            "language": input.locale.unwrap_or_else(|| "en-US".into()),
        });
        self.action(&input.provider_call_id, "speak", body).await
    }

    async fn start_listening(&self, input: StartListeningInput) -> Result<()> {
        let body = json!({
            "language": input.language.unwrap_or_else(|| "en".into()),
        });
        self.action(&input.provider_call_id, "transcription_start", body).await
    }

    async fn stop_listening(&self, input: StopListeningInput) -> Result<()> {
        self.action(&input.provider_call_id, "transcription_stop", json!({})).await
    }

    async fn answer_inbound(&self, call_id: &str, provider_call_id: &str) -> Result<()> {
        let body = json!({ "client_state": encode_client_state(call_id) });
        self.action(provider_call_id, "answer", body).await?;
        info!(call_id, provider_call_id, "[Telnyx] Inbound call answered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(body: Value) -> WebhookContext {
        WebhookContext {
            raw_body: body.to_string(),
            method: "POST".into(),
            ..Default::default()
        }
    }

    fn provider() -> TelnyxProvider {
        TelnyxProvider::new(TelnyxOptions::new("KEY", "conn-1"))
    }

    #[test]
    fn hangup_causes() {
        assert_eq!(map_hangup_cause(Some("normal_clearing")), EndReason::Completed);
        assert_eq!(map_hangup_cause(Some("originator_cancel")), EndReason::HangupBot);
        assert_eq!(map_hangup_cause(Some("user_busy")), EndReason::Busy);
        assert_eq!(map_hangup_cause(Some("timeout")), EndReason::NoAnswer);
        assert_eq!(map_hangup_cause(Some("unallocated_number")), EndReason::Failed);
        assert_eq!(map_hangup_cause(Some("something_new")), EndReason::Completed);
        assert_eq!(map_hangup_cause(None), EndReason::Completed);
    }

    #[test]
    fn client_state_carries_call_id() {
        let result = provider().parse_webhook_event(&ctx(json!({
            "data": {
                "id": "evt-1",
                "event_type": "call.answered",
                "payload": {
                    "call_control_id": "v3:abc",
                    "client_state": encode_client_state("call-42"),
                    "direction": "outgoing"
                }
            }
        })));
        let event = &result.events[0];
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.kind, CallEventKind::Answered);
        assert_eq!(event.call_id.as_deref(), Some("call-42"));
        assert_eq!(event.provider_call_id.as_deref(), Some("v3:abc"));
        assert_eq!(event.direction, Some(CallDirection::Outbound));
    }

    #[test]
    fn inbound_initiated_has_no_call_id() {
        let result = provider().parse_webhook_event(&ctx(json!({
            "data": {
                "id": "evt-2",
                "event_type": "call.initiated",
                "payload": {
                    "call_control_id": "v3:in",
                    "direction": "incoming",
                    "from": "+15550000000",
                    "to": "+15551112222"
                }
            }
        })));
        let event = &result.events[0];
        assert!(event.call_id.is_none());
        assert_eq!(event.direction, Some(CallDirection::Inbound));
        assert_eq!(event.from.as_deref(), Some("+15550000000"));
    }

    #[test]
    fn transcription_and_dtmf() {
        let telnyx = provider();
        let speech = telnyx.parse_webhook_event(&ctx(json!({
            "data": {
                "id": "evt-3",
                "event_type": "call.transcription",
                "payload": {
                    "call_control_id": "v3:abc",
                    "transcription_data": { "transcript": "yes please", "is_final": false, "confidence": 0.8 }
                }
            }
        })));
        assert_eq!(
            speech.events[0].kind,
            CallEventKind::Speech { transcript: "yes please".into(), is_final: false, confidence: Some(0.8) }
        );

        let dtmf = telnyx.parse_webhook_event(&ctx(json!({
            "data": { "id": "evt-4", "event_type": "call.dtmf.received", "payload": { "digit": "#" } }
        })));
        assert_eq!(dtmf.events[0].kind, CallEventKind::Dtmf { digits: "#".into() });
    }

    #[test]
    fn unknown_events_are_acknowledged_and_garbage_rejected() {
        let telnyx = provider();
        let ignored = telnyx.parse_webhook_event(&ctx(json!({
            "data": { "id": "evt-5", "event_type": "call.machine.detection.ended", "payload": {} }
        })));
        assert_eq!(ignored.status_code, 200);
        assert!(ignored.events.is_empty());

        let bad = telnyx.parse_webhook_event(&WebhookContext { raw_body: "{}".into(), ..Default::default() });
        assert_eq!(bad.status_code, 400);
    }

    #[test]
    fn missing_public_key_fails_verification() {
        let verification = provider().verify_webhook(&ctx(json!({})));
        assert!(!verification.ok);
    }
}
