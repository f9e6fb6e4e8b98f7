//! In-process carrier for tests and local development.
//!
//! Webhooks carry canonical events as JSON, either `{"events": [...]}` or a
//! single event object. Outbound operations are recorded, never sent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use callforge_core::{
    CallEvent, HangupCallInput, InitiateCallInput, InitiateCallResult, PlayTtsInput,
    ProviderAdapter, ProviderCallStatus, ProviderKind, StartListeningInput, StopListeningInput,
    WebhookContext, WebhookParseResult, WebhookVerification,
};

/// One recorded outbound operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOp {
    Initiate { call_id: String, to: String, inline_message: Option<String> },
    Hangup { provider_call_id: String },
    PlayTts { call_id: String, text: String },
    StartListening { call_id: String },
    StopListening { call_id: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MockPayload {
    Batch { events: Vec<CallEvent> },
    Single(Box<CallEvent>),
}

#[derive(Default)]
pub struct MockProvider {
    ops: Mutex<Vec<MockOp>>,
    fail_initiate: AtomicBool,
    latency_ms: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `initiate_call` requests fail.
    pub fn fail_initiate(&self, fail: bool) {
        self.fail_initiate.store(fail, Ordering::SeqCst);
    }

    /// Delay `play_tts` and `hangup_call` after recording them, like a
    /// carrier round trip.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn round_trip(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn operations(&self) -> Vec<MockOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Text of every `play_tts` so far, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::PlayTts { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: MockOp) {
        debug!(?op, "[Mock] operation");
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).push(op);
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn verify_webhook(&self, _ctx: &WebhookContext) -> WebhookVerification {
        WebhookVerification::ok()
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> WebhookParseResult {
        match serde_json::from_str::<MockPayload>(&ctx.raw_body) {
            Ok(MockPayload::Batch { events }) => WebhookParseResult::events(events),
            Ok(MockPayload::Single(event)) => WebhookParseResult::events(vec![*event]),
            Err(e) => WebhookParseResult::bad_request(format!("invalid mock payload: {e}")),
        }
    }

    async fn initiate_call(&self, input: InitiateCallInput) -> Result<InitiateCallResult> {
        if self.fail_initiate.load(Ordering::SeqCst) {
            bail!("mock initiation failure");
        }
        let provider_call_id = format!("mock-{}", input.call_id);
        self.record(MockOp::Initiate {
            call_id: input.call_id,
            to: input.to,
            inline_message: input.inline_message,
        });
        Ok(InitiateCallResult {
            provider_call_id,
            status: ProviderCallStatus::Initiated,
        })
    }

    async fn hangup_call(&self, input: HangupCallInput) -> Result<()> {
        self.record(MockOp::Hangup { provider_call_id: input.provider_call_id });
        self.round_trip().await;
        Ok(())
    }

    async fn play_tts(&self, input: PlayTtsInput) -> Result<()> {
        self.record(MockOp::PlayTts { call_id: input.call_id, text: input.text });
        self.round_trip().await;
        Ok(())
    }

    async fn start_listening(&self, input: StartListeningInput) -> Result<()> {
        self.record(MockOp::StartListening { call_id: input.call_id });
        Ok(())
    }

    async fn stop_listening(&self, input: StopListeningInput) -> Result<()> {
        self.record(MockOp::StopListening { call_id: input.call_id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callforge_core::CallEventKind;

    fn ctx(body: &str) -> WebhookContext {
        WebhookContext {
            raw_body: body.to_string(),
            method: "POST".into(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_batch_and_single_events() {
        let mock = MockProvider::new();
        let batch = mock.parse_webhook_event(&ctx(
            r#"{"events":[{"id":"e1","callId":"c1","type":"answered"},{"id":"e2","callId":"c1","type":"dtmf","digits":"1"}]}"#,
        ));
        assert_eq!(batch.status_code, 200);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[1].kind, CallEventKind::Dtmf { digits: "1".into() });

        let single = mock.parse_webhook_event(&ctx(r#"{"id":"e3","callId":"c1","type":"ringing"}"#));
        assert_eq!(single.events.len(), 1);
        assert_eq!(single.events[0].id, "e3");
    }

    #[test]
    fn rejects_garbage() {
        let result = MockProvider::new().parse_webhook_event(&ctx("not json"));
        assert_eq!(result.status_code, 400);
        assert!(result.events.is_empty());
    }

    #[tokio::test]
    async fn records_operations_and_can_fail() {
        let mock = MockProvider::new();
        let placed = mock
            .initiate_call(InitiateCallInput {
                call_id: "c1".into(),
                from: "+15550001111".into(),
                to: "+15550002222".into(),
                webhook_url: "http://localhost/voice/webhook".into(),
                inline_message: None,
            })
            .await
            .unwrap();
        assert_eq!(placed.provider_call_id, "mock-c1");

        mock.play_tts(PlayTtsInput {
            call_id: "c1".into(),
            provider_call_id: "mock-c1".into(),
            text: "hi".into(),
            voice: None,
            locale: None,
        })
        .await
        .unwrap();
        assert_eq!(mock.spoken(), vec!["hi"]);

        mock.fail_initiate(true);
        let err = mock
            .initiate_call(InitiateCallInput {
                call_id: "c2".into(),
                from: "+15550001111".into(),
                to: "+15550002222".into(),
                webhook_url: "http://localhost/voice/webhook".into(),
                inline_message: None,
            })
            .await;
        assert!(err.is_err());
        assert_eq!(mock.operations().len(), 2);
    }
}
