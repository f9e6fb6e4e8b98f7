//! End-to-end call flows against the mock carrier.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use callforge_calls::{
    CallManager, CallManagerConfig, CallOptions, CallStore, CallTimer, EventDisposition,
    ResponseGenerator,
};
use callforge_core::{
    CallDirection, CallError, CallEvent, CallEventKind, CallMode, CallRecord, CallState, EndReason,
    InboundPolicy, ProviderKind, Speaker,
};
use callforge_providers::{MockOp, MockProvider};
use callforge_security::InboundAcceptance;

const TO: &str = "+15550002222";

fn settings() -> CallManagerConfig {
    CallManagerConfig {
        webhook_url: Some("http://127.0.0.1:3334/voice/webhook".into()),
        ..Default::default()
    }
}

fn setup(settings: CallManagerConfig) -> (CallManager, Arc<MockProvider>) {
    let mock = Arc::new(MockProvider::new());
    (CallManager::new(mock.clone(), settings), mock)
}

fn event(id: &str, call_id: &str, kind: CallEventKind) -> CallEvent {
    CallEvent::with_id(id, kind).for_call(Some(call_id.to_string()))
}

fn speech(id: &str, call_id: &str, text: &str) -> CallEvent {
    event(
        id,
        call_id,
        CallEventKind::Speech {
            transcript: text.into(),
            is_final: true,
            confidence: Some(0.9),
        },
    )
}

fn inbound(id: &str, provider_call_id: &str, from: &str) -> CallEvent {
    CallEvent::with_id(id, CallEventKind::Ringing)
        .for_provider_call(provider_call_id)
        .with_parties(Some(CallDirection::Inbound), Some(from.into()), Some("+15550001111".into()))
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn hangups(mock: &MockProvider) -> usize {
    mock.operations()
        .iter()
        .filter(|op| matches!(op, MockOp::Hangup { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn notify_call_speaks_once_then_hangs_up() {
    let (manager, mock) = setup(settings());
    let call_id = manager
        .initiate_call(
            TO,
            None,
            CallOptions {
                message: Some("Hello there".into()),
                mode: Some(CallMode::Notify),
            },
        )
        .await
        .unwrap();

    manager.process_event(event("e1", &call_id, CallEventKind::Ringing)).await;
    manager.process_event(event("e2", &call_id, CallEventKind::Answered)).await;
    assert_eq!(mock.spoken(), vec!["Hello there".to_string()]);
    assert!(manager.has_pending_timer(&call_id, CallTimer::NotifyHangup));

    // A replayed answer must not speak again.
    manager.process_event(event("e2", &call_id, CallEventKind::Answered)).await;
    assert_eq!(mock.spoken().len(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;

    let call = manager.get_call(&call_id).unwrap();
    assert_eq!(call.state, CallState::HangupBot);
    assert_eq!(call.end_reason, Some(EndReason::HangupBot));
    assert_eq!(hangups(&mock), 1);
    assert!(manager.active_calls().is_empty());
    assert_eq!(call.transcript[0].speaker, Speaker::Bot);
    assert_eq!(call.transcript[0].text, "Hello there");
}

#[tokio::test]
async fn allowlist_accepts_known_callers_only() {
    let (manager, _mock) = setup(CallManagerConfig {
        inbound: InboundAcceptance::new(InboundPolicy::Allowlist, vec!["+15550003333".into()]),
        inbound_greeting: Some("Hi, how can I help?".into()),
        ..settings()
    });

    let refused = manager.process_event(inbound("in-1", "PC-1", "+15550009999")).await;
    assert_eq!(refused, EventDisposition::Rejected);
    assert!(manager.active_calls().is_empty());

    let accepted = manager.process_event(inbound("in-2", "PC-2", "+15550003333")).await;
    let EventDisposition::Applied { call_id } = accepted.clone() else {
        panic!("expected the allowlisted caller to be accepted, got {accepted:?}");
    };
    let call = manager.get_call(&call_id).unwrap();
    assert_eq!(call.direction, CallDirection::Inbound);
    assert_eq!(call.metadata.mode, Some(CallMode::Conversation));
    assert_eq!(call.state, CallState::Ringing);
    assert_eq!(
        manager.get_call_by_provider_call_id("PC-2").unwrap().call_id,
        call_id
    );
}

#[tokio::test]
async fn disabled_policy_rejects_every_inbound_call() {
    let (manager, _mock) = setup(settings());
    let outcome = manager.process_event(inbound("in-1", "PC-1", "+15550003333")).await;
    assert_eq!(outcome, EventDisposition::Rejected);
}

#[tokio::test]
async fn inbound_greeting_is_spoken_on_answer() {
    let (manager, mock) = setup(CallManagerConfig {
        inbound: InboundAcceptance::new(InboundPolicy::Open, Vec::new()),
        inbound_greeting: Some("Welcome".into()),
        ..settings()
    });
    let EventDisposition::Applied { call_id } =
        manager.process_event(inbound("in-1", "PC-1", "+15550004444")).await
    else {
        panic!("open policy should accept");
    };
    let answered = CallEvent::with_id("in-2", CallEventKind::Answered).for_provider_call("PC-1");
    manager.process_event(answered).await;
    assert_eq!(mock.spoken(), vec!["Welcome".to_string()]);
    assert!(!manager.has_pending_timer(&call_id, CallTimer::NotifyHangup));
}

#[tokio::test]
async fn duplicate_events_are_applied_once() {
    let (manager, _mock) = setup(settings());
    let call_id = manager
        .initiate_call(TO, None, CallOptions { message: None, mode: Some(CallMode::Conversation) })
        .await
        .unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;

    let first = manager.process_event(speech("s1", &call_id, "yes please")).await;
    let second = manager.process_event(speech("s1", &call_id, "yes please")).await;
    assert_eq!(first, EventDisposition::Applied { call_id: call_id.clone() });
    assert_eq!(second, EventDisposition::Duplicate { call_id: call_id.clone() });

    let call = manager.get_call(&call_id).unwrap();
    let user_lines = call.transcript.iter().filter(|t| t.speaker == Speaker::User).count();
    assert_eq!(user_lines, 1);
}

#[tokio::test]
async fn concurrency_cap_refuses_extra_calls() {
    let (manager, _mock) = setup(CallManagerConfig {
        max_concurrent_calls: 1,
        ..settings()
    });
    let first = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    let second = manager.initiate_call("+15550005555", None, CallOptions::default()).await;
    assert!(matches!(second, Err(CallError::ConcurrencyLimit(1))));

    manager.end_call(&first).await.unwrap();
    assert!(manager.initiate_call("+15550005555", None, CallOptions::default()).await.is_ok());
}

#[tokio::test]
async fn rejects_non_e164_destination() {
    let (manager, mock) = setup(settings());
    let err = manager.initiate_call("5550002222", None, CallOptions::default()).await;
    assert!(matches!(err, Err(CallError::Config(_))));
    assert!(mock.operations().is_empty());
}

#[tokio::test]
async fn provider_call_id_upgrade_repoints_index() {
    let (manager, _mock) = setup(settings());
    let call_id = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    let provisional = format!("mock-{call_id}");
    assert!(manager.get_call_by_provider_call_id(&provisional).is_some());

    let upgraded = event("e1", &call_id, CallEventKind::Ringing).for_provider_call("CALL-UUID-1");
    manager.process_event(upgraded).await;

    assert!(manager.get_call_by_provider_call_id(&provisional).is_none());
    let call = manager.get_call_by_provider_call_id("CALL-UUID-1").unwrap();
    assert_eq!(call.call_id, call_id);
    assert_eq!(call.provider_call_id.as_deref(), Some("CALL-UUID-1"));

    // Later events can arrive with the carrier id alone.
    let answered = CallEvent::with_id("e2", CallEventKind::Answered).for_provider_call("CALL-UUID-1");
    manager.process_event(answered).await;
    assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Answered);
}

#[tokio::test]
async fn carrier_hangup_moves_call_to_ended_cache() {
    let (manager, mock) = setup(settings());
    let call_id = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;
    manager
        .process_event(event("e2", &call_id, CallEventKind::Ended { reason: EndReason::HangupUser }))
        .await;

    assert!(manager.active_calls().is_empty());
    assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::HangupUser);
    assert!(!manager.has_pending_timer(&call_id, CallTimer::MaxDuration));
    manager.end_call(&call_id).await.unwrap();
    assert_eq!(hangups(&mock), 0);
    assert!(matches!(manager.speak(&call_id, "hello?").await, Err(CallError::AlreadyEnded(_))));
}

#[tokio::test]
async fn calls_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let call_id = {
        let mock = Arc::new(MockProvider::new());
        let manager = CallManager::builder(mock, settings())
            .store(CallStore::open(dir.path()).unwrap())
            .build();
        let call_id = manager
            .initiate_call(TO, Some("session-7".into()), CallOptions::default())
            .await
            .unwrap();
        manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;
        call_id
    };

    let mock = Arc::new(MockProvider::new());
    let manager = CallManager::builder(mock, settings())
        .store(CallStore::open(dir.path()).unwrap())
        .build();
    assert_eq!(manager.recover().await.unwrap(), 1);

    let call = manager.get_call(&call_id).unwrap();
    assert_eq!(call.state, CallState::Answered);
    assert_eq!(call.session_key.as_deref(), Some("session-7"));
    assert!(call.processed_event_ids.contains("e1"));
    assert!(manager.has_pending_timer(&call_id, CallTimer::MaxDuration));
    assert!(manager.get_call_by_provider_call_id(&format!("mock-{call_id}")).is_some());

    // Replayed events stay deduplicated across the restart.
    let replay = manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;
    assert_eq!(replay, EventDisposition::Duplicate { call_id });
}

#[tokio::test]
async fn recovery_ends_calls_past_their_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = CallStore::open(dir.path()).unwrap();
    let mut stale = CallRecord::new(ProviderKind::Mock, CallDirection::Outbound, "+15550001111", TO);
    stale.provider_call_id = Some("mock-stale".into());
    stale.transition(CallState::Answered);
    stale.answered_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    store.append(&stale).unwrap();
    let mut finished = CallRecord::new(ProviderKind::Mock, CallDirection::Outbound, "+15550001111", TO);
    finished.finish(EndReason::Completed);
    store.append(&finished).unwrap();

    let mock = Arc::new(MockProvider::new());
    let manager = CallManager::builder(mock.clone(), settings()).store(store).build();
    assert_eq!(manager.recover().await.unwrap(), 1);

    let call = manager.get_call(&stale.call_id).unwrap();
    assert_eq!(call.state, CallState::Timeout);
    assert_eq!(hangups(&mock), 1);
    assert!(manager.active_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn max_duration_ends_call_with_timeout() {
    let (manager, mock) = setup(CallManagerConfig {
        max_duration: Duration::from_secs(60),
        ..settings()
    });
    let call_id = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;

    assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Timeout);
    assert_eq!(hangups(&mock), 1);
}

#[tokio::test]
async fn listen_and_wait_returns_next_transcript() {
    let (manager, mock) = setup(settings());
    let call_id = manager
        .initiate_call(TO, None, CallOptions { message: None, mode: Some(CallMode::Conversation) })
        .await
        .unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;

    let waiting = {
        let manager = manager.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move { manager.listen_and_wait(&call_id, Some("What time works?")).await })
    };
    while !mock
        .operations()
        .iter()
        .any(|op| matches!(op, MockOp::StartListening { .. }))
    {
        tokio::task::yield_now().await;
    }
    manager.process_event(speech("s1", &call_id, "Tuesday at noon")).await;

    assert_eq!(waiting.await.unwrap().unwrap(), "Tuesday at noon");
    assert_eq!(mock.spoken(), vec!["What time works?".to_string()]);
    assert!(mock
        .operations()
        .iter()
        .any(|op| matches!(op, MockOp::StopListening { .. })));
    let call = manager.get_call(&call_id).unwrap();
    assert_eq!(call.state, CallState::Listening);
    assert_eq!(call.transcript.last().unwrap().text, "Tuesday at noon");
}

#[tokio::test(start_paused = true)]
async fn transcript_timeout_keeps_call_alive() {
    let (manager, _mock) = setup(CallManagerConfig {
        transcript_timeout: Duration::from_secs(5),
        ..settings()
    });
    let call_id = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;

    let outcome = manager.listen_and_wait(&call_id, None).await;
    assert!(matches!(outcome, Err(CallError::TranscriptTimeout(5000))));
    assert!(manager.get_call(&call_id).unwrap().state == CallState::Listening);
    assert_eq!(manager.active_calls().len(), 1);
}

#[tokio::test]
async fn ending_a_call_cancels_its_wait() {
    let (manager, _mock) = setup(settings());
    let call_id = manager.initiate_call(TO, None, CallOptions::default()).await.unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;

    let waiting = {
        let manager = manager.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move { manager.listen_and_wait(&call_id, None).await })
    };
    while manager.get_call(&call_id).unwrap().state != CallState::Listening {
        tokio::task::yield_now().await;
    }
    settle().await;
    manager.end_call(&call_id).await.unwrap();
    assert!(matches!(waiting.await.unwrap(), Err(CallError::WaitCancelled(_))));
}

struct Echo;

#[async_trait]
impl ResponseGenerator for Echo {
    async fn generate(&self, _call: &CallRecord, user_text: &str) -> Result<Option<String>> {
        Ok(Some(format!("You said {user_text}")))
    }
}

#[tokio::test]
async fn unsolicited_speech_gets_a_generated_reply() {
    let mock = Arc::new(MockProvider::new());
    let manager = CallManager::builder(mock.clone(), settings())
        .responder(Arc::new(Echo))
        .build();
    let call_id = manager
        .initiate_call(TO, None, CallOptions { message: None, mode: Some(CallMode::Conversation) })
        .await
        .unwrap();
    manager.process_event(event("e1", &call_id, CallEventKind::Answered)).await;
    manager.process_event(speech("s1", &call_id, "hello")).await;

    while mock.spoken().is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(mock.spoken(), vec!["You said hello".to_string()]);
}
