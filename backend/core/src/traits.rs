use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::event::CallEvent;
use crate::types::{EndReason, ProviderKind};

/// Inbound HTTP request as seen by an adapter.
///
/// Header names are lowercased. `url` is the externally visible URL the
/// carrier signed, including the query string.
#[derive(Debug, Clone, Default)]
pub struct WebhookContext {
    pub headers: HashMap<String, String>,
    pub raw_body: String,
    pub url: String,
    pub method: String,
    pub query: HashMap<String, String>,
    pub remote_address: Option<String>,
}

impl WebhookContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Outcome of webhook authenticity verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookVerification {
    pub ok: bool,
    pub reason: Option<String>,
}

impl WebhookVerification {
    pub fn ok() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn ok_with(reason: impl Into<String>) -> Self {
        Self { ok: true, reason: Some(reason.into()) }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { ok: false, reason: Some(reason.into()) }
    }
}

/// Normalized events plus the HTTP response to hand back to the carrier.
///
/// For markup-driven carriers the body is the next call-control document.
#[derive(Debug, Clone)]
pub struct WebhookParseResult {
    pub events: Vec<CallEvent>,
    pub status_code: u16,
    pub response_body: Option<String>,
    pub response_headers: Vec<(String, String)>,
}

impl WebhookParseResult {
    pub fn events(events: Vec<CallEvent>) -> Self {
        Self {
            events,
            status_code: 200,
            response_body: None,
            response_headers: Vec::new(),
        }
    }

    pub fn xml(events: Vec<CallEvent>, body: String) -> Self {
        Self {
            events,
            status_code: 200,
            response_body: Some(body),
            response_headers: vec![("content-type".into(), "text/xml".into())],
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            status_code: 400,
            response_body: Some(message.into()),
            response_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateCallInput {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub webhook_url: String,
    /// Greeting for notify mode, rendered inline by carriers that accept
    /// call-control markup at placement time.
    pub inline_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCallStatus {
    Queued,
    Initiated,
}

#[derive(Debug, Clone)]
pub struct InitiateCallResult {
    pub provider_call_id: String,
    pub status: ProviderCallStatus,
}

#[derive(Debug, Clone)]
pub struct HangupCallInput {
    pub call_id: String,
    pub provider_call_id: String,
    pub reason: EndReason,
}

#[derive(Debug, Clone)]
pub struct PlayTtsInput {
    pub call_id: String,
    pub provider_call_id: String,
    pub text: String,
    pub voice: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartListeningInput {
    pub call_id: String,
    pub provider_call_id: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StopListeningInput {
    pub call_id: String,
    pub provider_call_id: String,
}

/// One carrier backend: webhook verification, event normalization, and
/// outbound call control.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Check that an inbound request genuinely came from the carrier.
    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerification;

    /// Parse a verified webhook into canonical events and a response.
    fn parse_webhook_event(&self, ctx: &WebhookContext) -> WebhookParseResult;

    async fn initiate_call(&self, input: InitiateCallInput) -> Result<InitiateCallResult>;

    async fn hangup_call(&self, input: HangupCallInput) -> Result<()>;

    async fn play_tts(&self, input: PlayTtsInput) -> Result<()>;

    async fn start_listening(&self, input: StartListeningInput) -> Result<()>;

    async fn stop_listening(&self, input: StopListeningInput) -> Result<()>;

    /// Whether the initial message is delivered by the adapter's own media
    /// path (stream start) instead of on the `answered` event.
    fn defers_initial_message(&self) -> bool {
        false
    }

    /// Whether a notify-mode greeting is rendered into the placement
    /// request itself, so the engine must not speak it again on answer.
    fn renders_inline_message(&self) -> bool {
        false
    }

    /// Pick up an accepted inbound call. Markup carriers answer by
    /// returning call-control XML, so the default does nothing.
    async fn answer_inbound(&self, _call_id: &str, _provider_call_id: &str) -> Result<()> {
        Ok(())
    }

    /// Response for a webhook whose inbound call was refused.
    fn rejection_response(&self) -> Option<WebhookParseResult> {
        None
    }
}
