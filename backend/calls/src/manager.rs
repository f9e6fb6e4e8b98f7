//! The call orchestration core.
//!
//! `CallManager` owns every live `CallRecord`, the carrier-id reverse index,
//! per-call timers and transcript waiters. All carrier activity enters
//! through [`CallManager::process_event`]; outbound control goes through the
//! injected `ProviderAdapter`.
//!
//! Locking: the call table sits behind one std mutex that is never held
//! across an `.await`. Each operation mutates under the lock, snapshots the
//! record, releases, persists, then talks to the carrier.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use callforge_config::VoiceCallConfig;
use callforge_core::{
    is_e164, CallDirection, CallError, CallEvent, CallEventKind, CallMode, CallRecord, CallState,
    EndReason, HangupCallInput, InitiateCallInput, PlayTtsInput, ProviderAdapter, ProviderKind,
    Speaker, StartListeningInput, StopListeningInput,
};
use callforge_logging::redact_phone;
use callforge_media::{MediaStreamHandler, StreamEvent, StreamEventKind};
use callforge_scheduler::TimerRegistry;
use callforge_security::InboundAcceptance;

use crate::responder::ResponseGenerator;
use crate::store::CallStore;
use crate::waiter::TranscriptWaiters;

/// Ended calls kept in memory after leaving the active set.
pub const ENDED_CACHE_SIZE: usize = 256;

/// Caller id used with the mock carrier when no `fromNumber` is set.
const MOCK_FROM_NUMBER: &str = "+15550000000";

#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    pub from_number: Option<String>,
    pub max_concurrent_calls: usize,
    pub max_duration: Duration,
    pub transcript_timeout: Duration,
    pub notify_hangup_delay: Duration,
    pub default_mode: CallMode,
    pub inbound: InboundAcceptance,
    pub inbound_greeting: Option<String>,
    pub webhook_url: Option<String>,
}

impl CallManagerConfig {
    pub fn from_config(config: &VoiceCallConfig) -> Self {
        Self {
            from_number: config.from_number.clone(),
            max_concurrent_calls: config.max_concurrent_calls,
            max_duration: Duration::from_secs(config.max_duration_seconds),
            transcript_timeout: Duration::from_millis(config.transcript_timeout_ms),
            notify_hangup_delay: Duration::from_secs(config.outbound.notify_hangup_delay_sec),
            default_mode: config.outbound.default_mode,
            inbound: InboundAcceptance::new(config.inbound_policy, config.allow_from.clone()),
            inbound_greeting: config.inbound_greeting.clone(),
            webhook_url: config.webhook_url(),
        }
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self::from_config(&VoiceCallConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTimer {
    MaxDuration,
    NotifyHangup,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub message: Option<String>,
    pub mode: Option<CallMode>,
}

/// What `process_event` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    Applied { call_id: String },
    Duplicate { call_id: String },
    /// Unknown inbound caller refused by the acceptance policy.
    Rejected,
    /// Event for an unknown or already-ended call.
    Ignored,
}

enum FollowUp {
    AnswerInbound,
    StartMaxDuration,
    SpeakInitial,
    Transcript(String),
    Digits(String),
}

#[derive(Default)]
struct CallTable {
    active: HashMap<String, CallRecord>,
    by_provider: HashMap<String, String>,
    ended: VecDeque<CallRecord>,
    /// Calls whose hangup is in flight.
    ending: HashSet<String>,
}

impl CallTable {
    fn resolve(&self, call_id: Option<&str>, provider_call_id: Option<&str>) -> Option<String> {
        call_id
            .filter(|id| self.active.contains_key(*id))
            .map(str::to_string)
            .or_else(|| provider_call_id.and_then(|p| self.by_provider.get(p).cloned()))
    }

    fn find_ended(&self, call_id: Option<&str>, provider_call_id: Option<&str>) -> Option<&CallRecord> {
        self.ended.iter().rev().find(|r| {
            call_id.is_some_and(|id| r.call_id == id)
                || provider_call_id.is_some_and(|p| r.provider_call_id.as_deref() == Some(p))
        })
    }

    /// Live record that has been answered and not ended.
    fn connected(&mut self, call_id: &str) -> Result<&mut CallRecord, CallError> {
        if !self.active.contains_key(call_id) {
            return Err(match self.find_ended(Some(call_id), None) {
                Some(_) => CallError::AlreadyEnded(call_id.to_string()),
                None => CallError::CallNotFound(call_id.to_string()),
            });
        }
        let record = self
            .active
            .get_mut(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        if !record.state.is_connected() {
            return Err(CallError::NotConnected(call_id.to_string()));
        }
        Ok(record)
    }

    fn retire(&mut self, call_id: &str, reason: EndReason) -> Option<CallRecord> {
        self.ending.remove(call_id);
        let mut record = self.active.remove(call_id)?;
        record.finish(reason);
        self.by_provider.retain(|_, id| id != call_id);
        self.ended.push_back(record.clone());
        while self.ended.len() > ENDED_CACHE_SIZE {
            self.ended.pop_front();
        }
        Some(record)
    }
}

struct Inner {
    provider: Arc<dyn ProviderAdapter>,
    settings: CallManagerConfig,
    webhook_url: Mutex<Option<String>>,
    table: Mutex<CallTable>,
    store: Option<CallStore>,
    timers: TimerRegistry<(String, CallTimer)>,
    waiters: TranscriptWaiters,
    media: Option<MediaStreamHandler>,
    responder: Option<Arc<dyn ResponseGenerator>>,
}

pub struct CallManagerBuilder {
    provider: Arc<dyn ProviderAdapter>,
    settings: CallManagerConfig,
    store: Option<CallStore>,
    media: Option<MediaStreamHandler>,
    responder: Option<Arc<dyn ResponseGenerator>>,
}

impl CallManagerBuilder {
    pub fn store(mut self, store: CallStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn media(mut self, media: MediaStreamHandler) -> Self {
        self.media = Some(media);
        self
    }

    pub fn responder(mut self, responder: Arc<dyn ResponseGenerator>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn build(self) -> CallManager {
        let webhook_url = Mutex::new(self.settings.webhook_url.clone());
        CallManager {
            inner: Arc::new(Inner {
                provider: self.provider,
                settings: self.settings,
                webhook_url,
                table: Mutex::new(CallTable::default()),
                store: self.store,
                timers: TimerRegistry::new(),
                waiters: TranscriptWaiters::default(),
                media: self.media,
                responder: self.responder,
            }),
        }
    }
}

#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    pub fn builder(provider: Arc<dyn ProviderAdapter>, settings: CallManagerConfig) -> CallManagerBuilder {
        CallManagerBuilder {
            provider,
            settings,
            store: None,
            media: None,
            responder: None,
        }
    }

    pub fn new(provider: Arc<dyn ProviderAdapter>, settings: CallManagerConfig) -> Self {
        Self::builder(provider, settings).build()
    }

    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, record: &CallRecord) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.append(record) {
                error!(call_id = %record.call_id, error = %e, "Failed to persist call record");
            }
        }
    }

    fn provider_error(&self, err: anyhow::Error) -> CallError {
        CallError::provider(self.inner.provider.kind().as_str(), err)
    }

    pub fn provider(&self) -> &Arc<dyn ProviderAdapter> {
        &self.inner.provider
    }

    pub fn set_webhook_url(&self, url: impl Into<String>) {
        *self.inner.webhook_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.into());
    }

    pub fn webhook_url(&self) -> Option<String> {
        self.inner.webhook_url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Live call, or one of the recently ended ones.
    pub fn get_call(&self, call_id: &str) -> Option<CallRecord> {
        let table = self.table();
        table
            .active
            .get(call_id)
            .or_else(|| table.find_ended(Some(call_id), None))
            .cloned()
    }

    pub fn get_call_by_provider_call_id(&self, provider_call_id: &str) -> Option<CallRecord> {
        let table = self.table();
        table
            .by_provider
            .get(provider_call_id)
            .and_then(|id| table.active.get(id))
            .cloned()
    }

    pub fn active_calls(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self.table().active.values().cloned().collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    pub fn has_pending_timer(&self, call_id: &str, timer: CallTimer) -> bool {
        self.inner.timers.is_scheduled(&(call_id.to_string(), timer))
    }

    // -----------------------------------------------------------------------
    // Outbound control
    // -----------------------------------------------------------------------

    /// Place an outbound call. Returns the engine call id.
    pub async fn initiate_call(
        &self,
        to: &str,
        session_key: Option<String>,
        options: CallOptions,
    ) -> Result<String, CallError> {
        let provider = self.inner.provider.clone();
        let webhook_url = self.webhook_url().ok_or(CallError::NoWebhookUrl)?;
        let from = match (&self.inner.settings.from_number, provider.kind()) {
            (Some(from), _) => from.clone(),
            (None, ProviderKind::Mock) => MOCK_FROM_NUMBER.to_string(),
            (None, _) => return Err(CallError::NoFromNumber),
        };
        if !is_e164(to) {
            return Err(CallError::Config(format!("destination is not an E.164 number: {}", redact_phone(to))));
        }
        let mode = options.mode.unwrap_or(self.inner.settings.default_mode);
        let message = options.message.filter(|m| !m.trim().is_empty());

        let record = {
            let mut table = self.table();
            let max = self.inner.settings.max_concurrent_calls;
            if table.active.len() >= max {
                return Err(CallError::ConcurrencyLimit(max));
            }
            let mut record = CallRecord::new(provider.kind(), CallDirection::Outbound, from.clone(), to);
            record.session_key = session_key;
            record.metadata.mode = Some(mode);
            record.metadata.initial_message = message.clone();
            table.active.insert(record.call_id.clone(), record.clone());
            record
        };
        self.persist(&record);
        let call_id = record.call_id;
        info!(call_id = %call_id, to = %redact_phone(to), ?mode, "Placing outbound call");

        let inline_message = message.filter(|_| mode == CallMode::Notify && provider.renders_inline_message());
        let placed = provider
            .initiate_call(InitiateCallInput {
                call_id: call_id.clone(),
                from,
                to: to.to_string(),
                webhook_url,
                inline_message: inline_message.clone(),
            })
            .await;

        match placed {
            Ok(result) => {
                let snapshot = {
                    let mut guard = self.table();
                    let table = &mut *guard;
                    match table.active.get_mut(&call_id) {
                        Some(record) => {
                            record.provider_call_id = Some(result.provider_call_id.clone());
                            if let Some(message) = inline_message {
                                record.metadata.initial_message = None;
                                record.push_transcript(Speaker::Bot, message, true);
                            }
                            table.by_provider.insert(result.provider_call_id.clone(), call_id.clone());
                            Some(record.clone())
                        }
                        None => None,
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.persist(&snapshot);
                }
                info!(call_id = %call_id, provider_call_id = %result.provider_call_id, "Call placed");
                Ok(call_id)
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Provider failed to place call");
                self.finalize(&call_id, EndReason::Failed);
                Err(self.provider_error(e))
            }
        }
    }

    /// Speak `text` on a connected call.
    pub async fn speak(&self, call_id: &str, text: &str) -> Result<(), CallError> {
        let (snapshot, provider_call_id) = {
            let mut table = self.table();
            let record = table.connected(call_id)?;
            let provider_call_id = record
                .provider_call_id
                .clone()
                .ok_or_else(|| CallError::NotConnected(call_id.to_string()))?;
            record.transition(CallState::Speaking);
            record.push_transcript(Speaker::Bot, text, true);
            (record.clone(), provider_call_id)
        };
        self.persist(&snapshot);
        debug!(call_id, chars = text.len(), "Speaking");
        self.inner
            .provider
            .play_tts(PlayTtsInput {
                call_id: call_id.to_string(),
                provider_call_id,
                text: text.to_string(),
                voice: None,
                locale: None,
            })
            .await
            .map_err(|e| self.provider_error(e))
    }

    /// Optionally speak `prompt`, then wait for the caller's next utterance.
    pub async fn listen_and_wait(&self, call_id: &str, prompt: Option<&str>) -> Result<String, CallError> {
        if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
            self.speak(call_id, prompt).await?;
        }

        let (snapshot, provider_call_id) = {
            let mut table = self.table();
            let record = table.connected(call_id)?;
            let provider_call_id = record
                .provider_call_id
                .clone()
                .ok_or_else(|| CallError::NotConnected(call_id.to_string()))?;
            record.transition(CallState::Listening);
            (record.clone(), provider_call_id)
        };
        self.persist(&snapshot);

        // Register before capture starts so an early transcript is not lost.
        let (generation, rx) = self.inner.waiters.register(call_id);
        let provider = &self.inner.provider;
        if let Err(e) = provider
            .start_listening(StartListeningInput {
                call_id: call_id.to_string(),
                provider_call_id: provider_call_id.clone(),
                language: None,
            })
            .await
        {
            self.inner.waiters.release(call_id, generation);
            return Err(self.provider_error(e));
        }

        let timeout = self.inner.settings.transcript_timeout;
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::WaitCancelled("waiter dropped".into())),
            Err(_) => {
                self.inner.waiters.release(call_id, generation);
                warn!(call_id, timeout_ms = timeout.as_millis() as u64, "Transcript wait timed out");
                Err(CallError::TranscriptTimeout(timeout.as_millis() as u64))
            }
        };

        let still_active = self.table().active.contains_key(call_id);
        if still_active {
            if let Err(e) = provider
                .stop_listening(StopListeningInput {
                    call_id: call_id.to_string(),
                    provider_call_id,
                })
                .await
            {
                warn!(call_id, error = %e, "Failed to stop listening");
            }
        }
        outcome
    }

    /// Hang up. Ending an already-ended call succeeds.
    pub async fn end_call(&self, call_id: &str) -> Result<(), CallError> {
        self.end_with_reason(call_id, EndReason::HangupBot).await
    }

    async fn end_with_reason(&self, call_id: &str, reason: EndReason) -> Result<(), CallError> {
        let provider_call_id = {
            let mut guard = self.table();
            let table = &mut *guard;
            match table.active.get(call_id) {
                // Someone else is already hanging this call up.
                Some(_) if !table.ending.insert(call_id.to_string()) => return Ok(()),
                Some(record) => record.provider_call_id.clone(),
                None if table.find_ended(Some(call_id), None).is_some() => return Ok(()),
                None => return Err(CallError::CallNotFound(call_id.to_string())),
            }
        };
        if let Some(provider_call_id) = provider_call_id {
            let input = HangupCallInput {
                call_id: call_id.to_string(),
                provider_call_id,
                reason,
            };
            if let Err(e) = self.inner.provider.hangup_call(input).await {
                warn!(call_id, error = %e, "Carrier hangup failed, ending call locally");
            }
        }
        self.finalize(call_id, reason);
        Ok(())
    }

    /// Move a call to its terminal state and release everything it holds.
    fn finalize(&self, call_id: &str, reason: EndReason) -> Option<CallRecord> {
        let record = self.table().retire(call_id, reason)?;
        self.inner.timers.cancel_matching(|key| key.0 == call_id);
        self.inner.waiters.reject(call_id, "call ended");
        self.persist(&record);
        info!(call_id, state = %record.state, "Call ended");

        if let Some(media) = &self.inner.media {
            let media = media.clone();
            let id = call_id.to_string();
            tokio::spawn(async move {
                media.close_stream_for_call(&id).await;
            });
        }
        Some(record)
    }

    /// Speak a call's queued initial message, once.
    ///
    /// In notify mode the call is hung up `notifyHangupDelaySec` later.
    pub async fn speak_initial_message(&self, call_id: &str) -> Result<(), CallError> {
        let (message, mode) = {
            let mut table = self.table();
            let record = table
                .active
                .get_mut(call_id)
                .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
            let Some(message) = record.metadata.initial_message.take() else {
                return Ok(());
            };
            (message, record.metadata.mode.unwrap_or_default())
        };
        self.speak(call_id, &message).await?;

        match mode {
            CallMode::Notify => {
                // Held while scheduling so `finalize` cannot slip in between.
                let table = self.table();
                if !table.active.contains_key(call_id) {
                    debug!(call_id, "Call ended during the initial message");
                    return Ok(());
                }
                let delay = self.inner.settings.notify_hangup_delay;
                let weak = Arc::downgrade(&self.inner);
                let id = call_id.to_string();
                self.inner.timers.schedule((id.clone(), CallTimer::NotifyHangup), delay, async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let manager = CallManager { inner };
                    debug!(call_id = %id, "Notify hangup delay elapsed");
                    if let Err(e) = manager.end_call(&id).await {
                        debug!(call_id = %id, error = %e, "Notify hangup skipped");
                    }
                });
            }
            CallMode::Conversation if self.inner.responder.is_some() => self.start_capture(call_id).await,
            CallMode::Conversation => {}
        }
        Ok(())
    }

    async fn start_capture(&self, call_id: &str) {
        let provider_call_id = {
            let mut table = self.table();
            let Ok(record) = table.connected(call_id) else {
                return;
            };
            let Some(provider_call_id) = record.provider_call_id.clone() else {
                return;
            };
            record.transition(CallState::Listening);
            provider_call_id
        };
        let input = StartListeningInput {
            call_id: call_id.to_string(),
            provider_call_id,
            language: None,
        };
        if let Err(e) = self.inner.provider.start_listening(input).await {
            warn!(call_id, error = %e, "Failed to start listening");
        }
    }

    fn arm_max_duration(&self, call_id: &str, after: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let id = call_id.to_string();
        self.inner.timers.schedule((id.clone(), CallTimer::MaxDuration), after, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = CallManager { inner };
            warn!(call_id = %id, "Max call duration reached");
            if let Err(e) = manager.end_with_reason(&id, EndReason::Timeout).await {
                debug!(call_id = %id, error = %e, "Max-duration hangup skipped");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Apply one canonical event from the carrier.
    pub async fn process_event(&self, event: CallEvent) -> EventDisposition {
        let (disposition, follow_ups, finish) = self.apply_event(&event);
        if let EventDisposition::Applied { call_id } = &disposition {
            if let Some(reason) = finish {
                self.finalize(call_id, reason);
            }
            for follow_up in follow_ups {
                self.run_follow_up(call_id, follow_up).await;
            }
        }
        disposition
    }

    fn apply_event(&self, event: &CallEvent) -> (EventDisposition, Vec<FollowUp>, Option<EndReason>) {
        let mut follow_ups = Vec::new();
        let mut guard = self.table();
        let table = &mut *guard;

        let call_id = match table.resolve(event.call_id.as_deref(), event.provider_call_id.as_deref()) {
            Some(id) => id,
            None => {
                if table
                    .find_ended(event.call_id.as_deref(), event.provider_call_id.as_deref())
                    .is_some()
                {
                    debug!(event_id = %event.id, kind = event.kind.name(), "Event for ended call ignored");
                    return (EventDisposition::Ignored, follow_ups, None);
                }
                if event.direction != Some(CallDirection::Inbound) {
                    debug!(event_id = %event.id, kind = event.kind.name(), "Event for unknown call ignored");
                    return (EventDisposition::Ignored, follow_ups, None);
                }
                if !self.inner.settings.inbound.is_allowed(event.from.as_deref()) {
                    warn!(
                        caller = %event.from.as_deref().map(redact_phone).unwrap_or_default(),
                        "Inbound call rejected by policy"
                    );
                    return (EventDisposition::Rejected, follow_ups, None);
                }
                let record = self.inbound_record(event);
                let id = record.call_id.clone();
                if let Some(provider_call_id) = &record.provider_call_id {
                    table.by_provider.insert(provider_call_id.clone(), id.clone());
                }
                info!(
                    call_id = %id,
                    caller = %redact_phone(&record.from),
                    "Accepted inbound call"
                );
                table.active.insert(id.clone(), record);
                follow_ups.push(FollowUp::AnswerInbound);
                id
            }
        };

        let Some(record) = table.active.get_mut(&call_id) else {
            return (EventDisposition::Ignored, follow_ups, None);
        };
        if record.processed_event_ids.contains(&event.id) {
            debug!(call_id = %call_id, event_id = %event.id, "Duplicate event dropped");
            return (EventDisposition::Duplicate { call_id }, Vec::new(), None);
        }

        // The carrier replaced its id (provisional -> final).
        if let Some(new_id) = event.provider_call_id.as_deref() {
            if record.provider_call_id.as_deref() != Some(new_id) {
                if let Some(old_id) = record.provider_call_id.replace(new_id.to_string()) {
                    table.by_provider.remove(&old_id);
                    info!(call_id = %call_id, old = %old_id, new = %new_id, "Provider call id upgraded");
                }
                table.by_provider.insert(new_id.to_string(), call_id.clone());
            }
        }
        record.processed_event_ids.insert(event.id.clone());

        let mut finish = None;
        match &event.kind {
            CallEventKind::Initiated => {}
            CallEventKind::Ringing => {
                record.transition(CallState::Ringing);
            }
            CallEventKind::Answered | CallEventKind::Active | CallEventKind::Speaking { .. } => {
                let next = match &event.kind {
                    CallEventKind::Answered => CallState::Answered,
                    CallEventKind::Active => CallState::Active,
                    _ => CallState::Speaking,
                };
                // Carriers may skip `answered`; the first connected state counts.
                let first_connect = record.answered_at.is_none();
                if record.transition(next) && first_connect {
                    follow_ups.push(FollowUp::StartMaxDuration);
                    if record.metadata.initial_message.is_some() && !self.inner.provider.defers_initial_message() {
                        follow_ups.push(FollowUp::SpeakInitial);
                    }
                }
            }
            CallEventKind::Speech { transcript, is_final, .. } => {
                if *is_final && !transcript.trim().is_empty() {
                    record.push_transcript(Speaker::User, transcript.clone(), true);
                    record.transition(CallState::Listening);
                    follow_ups.push(FollowUp::Transcript(transcript.clone()));
                }
            }
            CallEventKind::Silence { .. } => {}
            CallEventKind::Dtmf { digits } => {
                record.push_transcript(Speaker::User, format!("[DTMF] {digits}"), true);
                follow_ups.push(FollowUp::Digits(digits.clone()));
            }
            CallEventKind::Ended { reason } => finish = Some(*reason),
            CallEventKind::Error { error, retryable } => {
                warn!(call_id = %call_id, error = %error, retryable, "Carrier reported an error");
                if !retryable {
                    finish = Some(EndReason::Error);
                }
            }
        }

        let snapshot = record.clone();
        drop(guard);
        if finish.is_none() {
            self.persist(&snapshot);
        }
        debug!(call_id = %call_id, kind = event.kind.name(), state = %snapshot.state, "Event applied");
        (EventDisposition::Applied { call_id }, follow_ups, finish)
    }

    fn inbound_record(&self, event: &CallEvent) -> CallRecord {
        let mut record = CallRecord::new(
            self.inner.provider.kind(),
            CallDirection::Inbound,
            event.from.clone().unwrap_or_default(),
            event.to.clone().unwrap_or_default(),
        );
        record.provider_call_id = event.provider_call_id.clone();
        record.metadata.mode = Some(CallMode::Conversation);
        record.metadata.initial_message = self.inner.settings.inbound_greeting.clone();
        record
    }

    async fn run_follow_up(&self, call_id: &str, follow_up: FollowUp) {
        match follow_up {
            FollowUp::AnswerInbound => {
                let provider_call_id = self.get_call(call_id).and_then(|c| c.provider_call_id);
                if let Some(provider_call_id) = provider_call_id {
                    if let Err(e) = self.inner.provider.answer_inbound(call_id, &provider_call_id).await {
                        warn!(call_id, error = %e, "Failed to answer inbound call");
                    }
                }
            }
            FollowUp::StartMaxDuration => self.arm_max_duration(call_id, self.inner.settings.max_duration),
            FollowUp::SpeakInitial => {
                if let Err(e) = self.speak_initial_message(call_id).await {
                    warn!(call_id, error = %e, "Failed to speak initial message");
                }
            }
            FollowUp::Transcript(text) => {
                if !self.inner.waiters.resolve(call_id, text.clone()) {
                    self.spawn_reply(call_id, text);
                }
            }
            FollowUp::Digits(digits) => {
                self.inner.waiters.resolve(call_id, digits);
            }
        }
    }

    /// Ask the response generator for a reply to an unsolicited utterance.
    fn spawn_reply(&self, call_id: &str, text: String) {
        let Some(responder) = self.inner.responder.clone() else {
            return;
        };
        let Some(call) = self.get_call(call_id) else {
            return;
        };
        if call.metadata.mode != Some(CallMode::Conversation) || call.is_terminal() {
            return;
        }
        let manager = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            match responder.generate(&call, &text).await {
                Ok(Some(reply)) => match manager.speak(&call_id, &reply).await {
                    Ok(()) => manager.start_capture(&call_id).await,
                    Err(e) => warn!(call_id = %call_id, error = %e, "Failed to speak reply"),
                },
                Ok(None) => debug!(call_id = %call_id, "Responder stayed silent"),
                Err(e) => warn!(call_id = %call_id, error = %e, "Response generation failed"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Media streams
    // -----------------------------------------------------------------------

    /// Drain media-stream events into the manager.
    pub fn attach_media_events(&self, mut events: mpsc::UnboundedReceiver<StreamEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_stream_event(event).await;
            }
        })
    }

    pub async fn handle_stream_event(&self, event: StreamEvent) {
        let call_id = {
            let table = self.table();
            table.resolve(event.call_id.as_deref(), Some(&event.provider_call_id))
        };
        let Some(call_id) = call_id else {
            debug!(stream_sid = %event.stream_sid, "Stream event for unknown call");
            return;
        };

        match event.kind {
            StreamEventKind::Connected => {
                self.set_stream_sid(&call_id, Some(event.stream_sid));
                if self.inner.provider.defers_initial_message() {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.speak_initial_message(&call_id).await {
                            warn!(call_id = %call_id, error = %e, "Failed to speak initial message");
                        }
                    });
                }
            }
            StreamEventKind::Transcript(text) => {
                let speech = CallEvent::new(CallEventKind::Speech {
                    transcript: text,
                    is_final: true,
                    confidence: None,
                })
                .for_call(Some(call_id))
                .for_provider_call(event.provider_call_id);
                self.process_event(speech).await;
            }
            StreamEventKind::PartialTranscript(text) => {
                debug!(call_id = %call_id, chars = text.len(), "Partial transcript");
            }
            StreamEventKind::SpeechStarted => {
                debug!(call_id = %call_id, "Caller started speaking");
            }
            StreamEventKind::Disconnected => self.set_stream_sid(&call_id, None),
        }
    }

    fn set_stream_sid(&self, call_id: &str, stream_sid: Option<String>) {
        let snapshot = {
            let mut table = self.table();
            table.active.get_mut(call_id).map(|record| {
                record.metadata.stream_sid = stream_sid;
                record.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Rehydrate non-terminal calls from the store and re-arm their
    /// max-duration timers. Calls already past their budget are ended.
    pub async fn recover(&self) -> Result<usize, CallError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let records = store.load_active().map_err(|e| CallError::Storage(e.to_string()))?;
        let count = records.len();
        let max = self.inner.settings.max_duration;
        let now = Utc::now();
        let mut rearm = Vec::new();
        let mut expired = Vec::new();
        {
            let mut table = self.table();
            for record in records {
                if let Some(answered_at) = record.answered_at {
                    let elapsed = (now - answered_at).to_std().unwrap_or_default();
                    match max.checked_sub(elapsed) {
                        Some(remaining) if !remaining.is_zero() => rearm.push((record.call_id.clone(), remaining)),
                        _ => expired.push(record.call_id.clone()),
                    }
                }
                if let Some(provider_call_id) = &record.provider_call_id {
                    table.by_provider.insert(provider_call_id.clone(), record.call_id.clone());
                }
                table.active.insert(record.call_id.clone(), record);
            }
        }
        for (call_id, remaining) in rearm {
            self.arm_max_duration(&call_id, remaining);
        }
        for call_id in expired {
            warn!(call_id = %call_id, "Recovered call exceeded max duration");
            if let Err(e) = self.end_with_reason(&call_id, EndReason::Timeout).await {
                warn!(call_id = %call_id, error = %e, "Failed to end expired call");
            }
        }
        info!(count, "Recovered active calls");
        Ok(count)
    }
}
