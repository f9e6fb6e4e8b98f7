//! Twilio Programmable Voice.
//!
//! Calls are driven by TwiML returned from the webhook. Anything the engine
//! wants to do mid-call is parked in [`PendingInstructions`] and the live
//! call is redirected back to the webhook to fetch it. With media streaming
//! enabled the answer TwiML connects a bidirectional stream instead and
//! speech goes out as mu-law frames through the stream's TTS queue.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use callforge_core::{
    CallDirection, CallEvent, CallEventKind, EndReason, HangupCallInput, InitiateCallInput,
    InitiateCallResult, PlayTtsInput, ProviderAdapter, ProviderCallStatus, ProviderKind,
    StartListeningInput, StopListeningInput, WebhookContext, WebhookParseResult,
    WebhookVerification,
};
use callforge_media::PlaybackOutcome;
use callforge_security::{TwilioVerifyOptions, form_params, verify_twilio_webhook};

use crate::markup::{element, flow_url, response, text_element};
use crate::pending::PendingInstructions;
use crate::{StreamingBackend, check_status, non_empty};

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Seconds a parked call waits before polling the webhook again.
const HOLD_SECS: &str = "30";

#[derive(Debug, Clone)]
pub struct TwilioOptions {
    pub account_sid: String,
    pub auth_token: String,
    /// Public webhook URL, used for placement and redirects.
    pub webhook_url: Option<String>,
    pub public_url: Option<String>,
    pub skip_verification: bool,
    pub allow_ngrok_free_tier_loopback_bypass: bool,
    /// `wss://` URL of the media-stream endpoint, when streaming is on.
    pub stream_url: Option<String>,
    pub ring_timeout_secs: u64,
    pub voice: Option<String>,
    pub base_url: String,
}

impl TwilioOptions {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            webhook_url: None,
            public_url: None,
            skip_verification: false,
            allow_ngrok_free_tier_loopback_bypass: false,
            stream_url: None,
            ring_timeout_secs: 30,
            voice: None,
            base_url: TWILIO_API_BASE.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CreateCallResponse {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct TwilioProvider {
    options: TwilioOptions,
    http: reqwest::Client,
    pending: PendingInstructions,
    webhook_url: Mutex<Option<String>>,
    streaming: Option<StreamingBackend>,
}

impl TwilioProvider {
    pub fn new(options: TwilioOptions, streaming: Option<StreamingBackend>) -> Self {
        let webhook_url = Mutex::new(options.webhook_url.clone());
        let streaming = streaming.filter(|_| options.stream_url.is_some());
        Self {
            options,
            http: reqwest::Client::new(),
            pending: PendingInstructions::default(),
            webhook_url,
            streaming,
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls",
            self.options.base_url.trim_end_matches('/'),
            self.options.account_sid
        )
    }

    fn webhook_base(&self) -> Result<String> {
        self.webhook_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("Twilio webhook URL not known yet"))
    }

    fn say(&self, text: &str) -> String {
        match &self.options.voice {
            Some(voice) => text_element("Say", &[("voice", voice.as_str())], text),
            None => text_element("Say", &[], text),
        }
    }

    fn gather(&self, base: &str, call_id: &str, language: Option<&str>) -> String {
        let action = flow_url(base, "gather", Some(call_id));
        let mut attrs = vec![
            ("input", "speech dtmf"),
            ("speechTimeout", "auto"),
            ("method", "POST"),
            ("action", action.as_str()),
        ];
        if let Some(language) = language {
            attrs.push(("language", language));
        }
        element("Gather", &attrs, None)
    }

    /// Drained instructions, or a hold loop that polls again.
    fn next_instructions(&self, provider_call_id: &str, call_id: Option<&str>) -> String {
        let verbs = self.pending.take(provider_call_id);
        let Ok(base) = self.webhook_base() else {
            return response(verbs);
        };
        let redirect = element("Redirect", &[("method", "POST")], Some(&flow_url(&base, "redirect", call_id)));
        if verbs.is_empty() {
            return response([element("Pause", &[("length", HOLD_SECS)], None), redirect]);
        }
        response(verbs.into_iter().chain(std::iter::once(redirect)))
    }

    fn answer_twiml(&self, provider_call_id: &str, call_id: Option<&str>) -> String {
        if let (Some(_), Some(stream_url)) = (&self.streaming, &self.options.stream_url) {
            let params = call_id
                .map(|id| element("Parameter", &[("name", "callId"), ("value", id)], None))
                .unwrap_or_default();
            let stream = element("Stream", &[("url", stream_url.as_str())], Some(&params));
            return response([element("Connect", &[], Some(&stream))]);
        }
        self.next_instructions(provider_call_id, call_id)
    }

    /// Point a live call at a new TwiML URL.
    async fn redirect(&self, provider_call_id: &str, call_id: &str) -> Result<()> {
        let url = flow_url(&self.webhook_base()?, "redirect", Some(call_id));
        let resp = self
            .http
            .post(format!("{}/{}.json", self.calls_url(), provider_call_id))
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&[("Url", url.as_str()), ("Method", "POST")])
            .send()
            .await
            .context("Twilio redirect request failed")?;
        check_status(resp, "Twilio").await?;
        debug!(provider_call_id, "[Twilio] Redirected call");
        Ok(())
    }

    async fn play_over_stream(&self, backend: &StreamingBackend, stream_sid: String, input: &PlayTtsInput) -> Result<()> {
        let tts = backend.tts.clone();
        let handler = backend.handler.clone();
        let text = input.text.clone();
        let voice = input.voice.clone();
        let sid = stream_sid.clone();
        let done = backend.handler.queue_tts(&stream_sid, move |cancel| async move {
            let audio = tts.synthesize_for_telephony(&text, voice.as_deref()).await?;
            match handler.play_audio(&sid, audio, &cancel).await? {
                PlaybackOutcome::Failed(reason) => Err(anyhow!(reason)),
                _ => Ok(()),
            }
        })?;
        match done.await {
            Ok(PlaybackOutcome::Failed(reason)) => Err(anyhow!("stream playback failed: {reason}")),
            Ok(outcome) => {
                debug!(stream_sid = %stream_sid, ?outcome, "[Twilio] Stream playback settled");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }
}

fn map_status(status: &str, answered_by: Option<&str>) -> Option<CallEventKind> {
    let kind = match status {
        "queued" | "initiated" => CallEventKind::Initiated,
        "ringing" => CallEventKind::Ringing,
        "in-progress" => CallEventKind::Answered,
        "completed" if answered_by.is_some_and(|a| a.starts_with("machine")) => {
            CallEventKind::Ended { reason: EndReason::Voicemail }
        }
        "completed" => CallEventKind::Ended { reason: EndReason::Completed },
        "busy" => CallEventKind::Ended { reason: EndReason::Busy },
        "no-answer" => CallEventKind::Ended { reason: EndReason::NoAnswer },
        "failed" => CallEventKind::Ended { reason: EndReason::Failed },
        "canceled" => CallEventKind::Ended { reason: EndReason::HangupBot },
        _ => return None,
    };
    Some(kind)
}

fn direction(raw: Option<&str>) -> Option<CallDirection> {
    match raw? {
        "inbound" => Some(CallDirection::Inbound),
        d if d.starts_with("outbound") => Some(CallDirection::Outbound),
        _ => None,
    }
}

#[async_trait]
impl ProviderAdapter for TwilioProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Twilio
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerification {
        verify_twilio_webhook(
            ctx,
            &self.options.auth_token,
            TwilioVerifyOptions {
                public_url: self.options.public_url.as_deref(),
                skip_verification: self.options.skip_verification,
                allow_ngrok_free_tier_loopback_bypass: self.options.allow_ngrok_free_tier_loopback_bypass,
            },
        )
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> WebhookParseResult {
        let params: HashMap<String, String> = form_params(&ctx.raw_body).into_iter().collect();
        let Some(call_sid) = non_empty(&params, "CallSid") else {
            return WebhookParseResult::bad_request("missing CallSid");
        };
        let call_id = ctx.query_param("callId").map(str::to_string);
        let flow = ctx.query_param("flow").unwrap_or("answer");
        let direction = direction(non_empty(&params, "Direction"));
        let from = non_empty(&params, "From").map(str::to_string);
        let to = non_empty(&params, "To").map(str::to_string);

        let tag = |event: CallEvent| {
            event
                .for_call(call_id.clone())
                .for_provider_call(call_sid)
                .with_parties(direction, from.clone(), to.clone())
        };

        let mut events = Vec::new();
        if let Some(status) = non_empty(&params, "CallStatus") {
            if flow == "status" || flow == "answer" {
                if let Some(kind) = map_status(status, non_empty(&params, "AnsweredBy")) {
                    let id = match ctx.header("i-twilio-idempotency-token") {
                        Some(token) if flow == "status" => token.to_string(),
                        _ => format!("{call_sid}:{status}"),
                    };
                    events.push(tag(CallEvent::with_id(id, kind)));
                }
            }
        }
        if flow == "answer" && direction == Some(CallDirection::Inbound) {
            // Returning TwiML picks the call up.
            events.push(tag(CallEvent::with_id(format!("{call_sid}:answered"), CallEventKind::Answered)));
        }

        if let Some(digits) = non_empty(&params, "Digits") {
            events.push(tag(CallEvent::new(CallEventKind::Dtmf { digits: digits.to_string() })));
        } else if let Some(transcript) = non_empty(&params, "SpeechResult") {
            let confidence = non_empty(&params, "Confidence").and_then(|c| c.parse().ok());
            events.push(tag(CallEvent::new(CallEventKind::Speech {
                transcript: transcript.to_string(),
                is_final: true,
                confidence,
            })));
        }

        let body = match flow {
            "status" => response(Vec::<String>::new()),
            "answer" => self.answer_twiml(call_sid, call_id.as_deref()),
            _ => self.next_instructions(call_sid, call_id.as_deref()),
        };
        if events.iter().any(|e| matches!(e.kind, CallEventKind::Ended { .. })) {
            self.pending.forget(call_sid);
        }
        WebhookParseResult::xml(events, body)
    }

    async fn initiate_call(&self, input: InitiateCallInput) -> Result<InitiateCallResult> {
        *self.webhook_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(input.webhook_url.clone());

        let status_callback = flow_url(&input.webhook_url, "status", Some(&input.call_id));
        let ring_timeout = self.options.ring_timeout_secs.to_string();
        let mut form: Vec<(&str, String)> = vec![
            ("To", input.to.clone()),
            ("From", input.from.clone()),
            ("StatusCallback", status_callback),
            ("StatusCallbackMethod", "POST".into()),
            ("Timeout", ring_timeout),
        ];
        for event in ["initiated", "ringing", "answered", "completed"] {
            form.push(("StatusCallbackEvent", event.into()));
        }
        match input.inline_message.as_deref().filter(|_| self.renders_inline_message()) {
            Some(message) => form.push(("Twiml", response([self.say(message), element("Hangup", &[], None)]))),
            None => form.push(("Url", flow_url(&input.webhook_url, "answer", Some(&input.call_id)))),
        }

        let resp = self
            .http
            .post(format!("{}.json", self.calls_url()))
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form)
            .send()
            .await
            .context("Twilio create-call request failed")?;
        let created: CreateCallResponse = check_status(resp, "Twilio")
            .await?
            .json()
            .await
            .context("Failed to parse Twilio create-call response")?;

        info!(call_id = %input.call_id, provider_call_id = %created.sid, "[Twilio] Call placed");
        Ok(InitiateCallResult {
            provider_call_id: created.sid,
            status: match created.status.as_deref() {
                Some("queued") => ProviderCallStatus::Queued,
                _ => ProviderCallStatus::Initiated,
            },
        })
    }

    async fn hangup_call(&self, input: HangupCallInput) -> Result<()> {
        self.pending.forget(&input.provider_call_id);
        if let Some(backend) = &self.streaming {
            backend.handler.close_stream_for_call(&input.call_id).await;
        }
        let resp = self
            .http
            .post(format!("{}/{}.json", self.calls_url(), input.provider_call_id))
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .context("Twilio hangup request failed")?;
        check_status(resp, "Twilio").await?;
        info!(call_id = %input.call_id, reason = %input.reason, "[Twilio] Call hung up");
        Ok(())
    }

    async fn play_tts(&self, input: PlayTtsInput) -> Result<()> {
        if let Some(backend) = &self.streaming {
            let stream_sid = backend
                .handler
                .stream_for_call(&input.call_id)
                .or_else(|| backend.handler.stream_for_call(&input.provider_call_id));
            match stream_sid {
                Some(sid) => return self.play_over_stream(backend, sid, &input).await,
                None => warn!(call_id = %input.call_id, "[Twilio] No media stream, falling back to <Say>"),
            }
        }
        self.pending.push_speech(&input.provider_call_id, self.say(&input.text));
        self.redirect(&input.provider_call_id, &input.call_id).await
    }

    async fn start_listening(&self, input: StartListeningInput) -> Result<()> {
        if let Some(backend) = &self.streaming {
            if let Some(stream_sid) = backend.handler.stream_for_call(&input.call_id) {
                match backend.handler.ensure_session(&stream_sid).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(
                        call_id = %input.call_id,
                        "[Twilio] No realtime transcription ({e}), falling back to <Gather>"
                    ),
                }
            }
        }
        let gather = self.gather(&self.webhook_base()?, &input.call_id, input.language.as_deref());
        if self.pending.push_listen(&input.provider_call_id, gather) {
            self.redirect(&input.provider_call_id, &input.call_id).await?;
        }
        Ok(())
    }

    async fn stop_listening(&self, input: StopListeningInput) -> Result<()> {
        self.pending.cancel_listen(&input.provider_call_id);
        Ok(())
    }

    fn defers_initial_message(&self) -> bool {
        self.streaming.is_some()
    }

    fn renders_inline_message(&self) -> bool {
        self.streaming.is_none()
    }

    fn rejection_response(&self) -> Option<WebhookParseResult> {
        Some(WebhookParseResult::xml(
            Vec::new(),
            response([element("Reject", &[], None)]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> TwilioProvider {
        let mut options = TwilioOptions::new("AC123", "token");
        options.webhook_url = Some("https://voice.example.com/voice/webhook".into());
        TwilioProvider::new(options, None)
    }

    fn ctx(query: &[(&str, &str)], body: &str) -> WebhookContext {
        WebhookContext {
            raw_body: body.to_string(),
            method: "POST".into(),
            url: "https://voice.example.com/voice/webhook".into(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn status_callbacks_map_to_canonical_events() {
        let twilio = provider();
        let cases = [
            ("ringing", CallEventKind::Ringing),
            ("in-progress", CallEventKind::Answered),
            ("busy", CallEventKind::Ended { reason: EndReason::Busy }),
            ("no-answer", CallEventKind::Ended { reason: EndReason::NoAnswer }),
            ("canceled", CallEventKind::Ended { reason: EndReason::HangupBot }),
            ("completed", CallEventKind::Ended { reason: EndReason::Completed }),
        ];
        for (status, expected) in cases {
            let body = format!("CallSid=CA1&CallStatus={status}&Direction=outbound-api");
            let result = twilio.parse_webhook_event(&ctx(&[("flow", "status"), ("callId", "c1")], &body));
            assert_eq!(result.events.len(), 1, "{status}");
            let event = &result.events[0];
            assert_eq!(event.kind, expected);
            assert_eq!(event.id, format!("CA1:{status}"));
            assert_eq!(event.call_id.as_deref(), Some("c1"));
            assert_eq!(event.provider_call_id.as_deref(), Some("CA1"));
        }
    }

    #[test]
    fn redelivered_status_shares_an_id() {
        let twilio = provider();
        let mut first = ctx(&[("flow", "status")], "CallSid=CA1&CallStatus=ringing");
        first.headers.insert("i-twilio-idempotency-token".into(), "tok-1".into());
        let again = first.clone();
        assert_eq!(
            twilio.parse_webhook_event(&first).events[0].id,
            twilio.parse_webhook_event(&again).events[0].id
        );
        assert_eq!(twilio.parse_webhook_event(&first).events[0].id, "tok-1");
    }

    #[test]
    fn digits_win_over_speech() {
        let twilio = provider();
        let result = twilio.parse_webhook_event(&ctx(
            &[("flow", "gather"), ("callId", "c1")],
            "CallSid=CA1&CallStatus=in-progress&Digits=42&SpeechResult=hello",
        ));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].kind, CallEventKind::Dtmf { digits: "42".into() });
    }

    #[test]
    fn gather_speech_becomes_final_transcript() {
        let twilio = provider();
        let result = twilio.parse_webhook_event(&ctx(
            &[("flow", "gather"), ("callId", "c1")],
            "CallSid=CA1&SpeechResult=book+a+table&Confidence=0.9",
        ));
        match &result.events[0].kind {
            CallEventKind::Speech { transcript, is_final, confidence } => {
                assert_eq!(transcript, "book a table");
                assert!(*is_final);
                assert_eq!(*confidence, Some(0.9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_call_sid_is_bad_request() {
        let result = provider().parse_webhook_event(&ctx(&[("flow", "status")], "CallStatus=ringing"));
        assert_eq!(result.status_code, 400);
        assert!(result.events.is_empty());
    }

    #[test]
    fn inbound_answer_creates_answered_event_and_holds() {
        let twilio = provider();
        let result = twilio.parse_webhook_event(&ctx(
            &[],
            "CallSid=CA9&CallStatus=ringing&Direction=inbound&From=%2B15550000000&To=%2B15551112222",
        ));
        let kinds: Vec<_> = result.events.iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["ringing", "answered"]);
        assert_eq!(result.events[0].direction, Some(CallDirection::Inbound));
        assert_eq!(result.events[0].from.as_deref(), Some("+15550000000"));
        let body = result.response_body.unwrap();
        assert!(body.contains(r#"<Pause length="30"/>"#));
        assert!(body.contains("flow=redirect"));
    }

    #[test]
    fn redirect_drains_parked_speech() {
        let twilio = provider();
        twilio.pending.push_speech("CA1", twilio.say("Hello & welcome"));
        let result = twilio.parse_webhook_event(&ctx(&[("flow", "redirect"), ("callId", "c1")], "CallSid=CA1"));
        let body = result.response_body.unwrap();
        assert!(body.contains("<Say>Hello &amp; welcome</Say><Redirect"));
        assert!(result.events.is_empty());
    }

    #[test]
    fn streaming_answer_connects_stream() {
        let mut options = TwilioOptions::new("AC123", "token");
        options.webhook_url = Some("https://voice.example.com/voice/webhook".into());
        options.stream_url = Some("wss://voice.example.com/voice/stream".into());
        let (handler, _events) = callforge_media::MediaStreamHandler::new(None);
        let tts = callforge_tts::create_tts(callforge_tts::TtsProviderKind::OpenAi {
            api_key: "k".into(),
            model: None,
            voice: None,
        });
        let twilio = TwilioProvider::new(options, Some(StreamingBackend { handler, tts }));
        assert!(twilio.defers_initial_message());
        assert!(!twilio.renders_inline_message());

        let result = twilio.parse_webhook_event(&ctx(
            &[("flow", "answer"), ("callId", "c1")],
            "CallSid=CA1&CallStatus=in-progress&Direction=outbound-api",
        ));
        let body = result.response_body.unwrap();
        assert!(body.contains(r#"<Connect><Stream url="wss://voice.example.com/voice/stream">"#));
        assert!(body.contains(r#"<Parameter name="callId" value="c1"/>"#));
    }

    #[test]
    fn rejection_is_reject_twiml() {
        let body = provider().rejection_response().unwrap().response_body.unwrap();
        assert!(body.contains("<Reject/>"));
    }
}
