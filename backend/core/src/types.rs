use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine-generated call identifier. Stable for the whole life of a call.
pub type CallId = String;

/// Carrier backend that owns a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Telnyx,
    Twilio,
    Plivo,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telnyx => "telnyx",
            Self::Twilio => "twilio",
            Self::Plivo => "plivo",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telnyx" => Ok(Self::Telnyx),
            "twilio" => Ok(Self::Twilio),
            "plivo" => Ok(Self::Plivo),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// How an outbound call behaves once answered.
///
/// `Notify` speaks the initial message and hangs up; `Conversation` keeps
/// the line open for a back-and-forth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    #[default]
    Notify,
    Conversation,
}

impl FromStr for CallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notify" => Ok(Self::Notify),
            "conversation" => Ok(Self::Conversation),
            other => Err(format!("unknown call mode: {other}")),
        }
    }
}

/// Who may call in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InboundPolicy {
    #[default]
    Disabled,
    Open,
    Allowlist,
    Pairing,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    // Terminal states
    Completed,
    Busy,
    NoAnswer,
    Failed,
    HangupBot,
    HangupUser,
    Voicemail,
    Error,
    Timeout,
}

/// Non-terminal states in the order a call may advance through them.
const STATE_ORDER: [CallState; 6] = [
    CallState::Initiated,
    CallState::Ringing,
    CallState::Answered,
    CallState::Active,
    CallState::Speaking,
    CallState::Listening,
];

impl CallState {
    pub fn is_terminal(self) -> bool {
        !STATE_ORDER.contains(&self)
    }

    /// `Speaking` and `Listening` may toggle between each other freely.
    pub fn is_conversational(self) -> bool {
        matches!(self, CallState::Speaking | CallState::Listening)
    }

    /// Whether the far end has picked up and the call has not ended.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            CallState::Answered | CallState::Active | CallState::Speaking | CallState::Listening
        )
    }

    fn rank(self) -> Option<usize> {
        STATE_ORDER.iter().position(|s| *s == self)
    }

    /// Whether `self -> next` is accepted.
    ///
    /// Terminal states are absorbing. A terminal target is always accepted
    /// from a live state, conversational states toggle freely, and anything
    /// else must move strictly forward in [`STATE_ORDER`]. Rejected
    /// transitions are dropped by callers, which is how late or duplicated
    /// webhooks are tolerated.
    pub fn can_transition_to(self, next: CallState) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        if self.is_conversational() && next.is_conversational() {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target > current,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Why a call ended. Each reason maps to exactly one terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Completed,
    HangupUser,
    HangupBot,
    Timeout,
    Busy,
    NoAnswer,
    Failed,
    Error,
    Voicemail,
}

impl EndReason {
    pub fn terminal_state(self) -> CallState {
        match self {
            Self::Completed => CallState::Completed,
            Self::HangupUser => CallState::HangupUser,
            Self::HangupBot => CallState::HangupBot,
            Self::Timeout => CallState::Timeout,
            Self::Busy => CallState::Busy,
            Self::NoAnswer => CallState::NoAnswer,
            Self::Failed => CallState::Failed,
            Self::Error => CallState::Error,
            Self::Voicemail => CallState::Voicemail,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.terminal_state().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Call record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// Scratch space attached to a call. Not authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Message to speak once the call connects; taken when delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CallMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Aggregate root for one telephone call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
    pub provider: ProviderKind,
    pub direction: CallDirection,
    pub state: CallState,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub processed_event_ids: HashSet<String>,
    #[serde(default)]
    pub metadata: CallMetadata,
}

impl CallRecord {
    pub fn new(
        provider: ProviderKind,
        direction: CallDirection,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            provider_call_id: None,
            provider,
            direction,
            state: CallState::Initiated,
            from: from.into(),
            to: to.into(),
            session_key: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            transcript: Vec::new(),
            processed_event_ids: HashSet::new(),
            metadata: CallMetadata::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state transition if the state machine allows it.
    ///
    /// Returns `false` when the request was dropped.
    pub fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_connected() && self.answered_at.is_none() {
            self.answered_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    /// Move to the terminal state for `reason` and record it.
    pub fn finish(&mut self, reason: EndReason) -> bool {
        if !self.transition(reason.terminal_state()) {
            return false;
        }
        self.end_reason = Some(reason);
        true
    }

    pub fn push_transcript(&mut self, speaker: Speaker, text: impl Into<String>, is_final: bool) {
        self.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            speaker,
            text: text.into(),
            is_final,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::new(ProviderKind::Mock, CallDirection::Outbound, "+15550001111", "+15550002222")
    }

    #[test]
    fn forward_transitions_are_accepted() {
        let mut call = record();
        assert!(call.transition(CallState::Ringing));
        assert!(call.transition(CallState::Answered));
        assert!(call.answered_at.is_some());
        assert!(call.transition(CallState::Active));
        assert_eq!(call.state, CallState::Active);
    }

    #[test]
    fn skipping_answered_still_stamps_answer_time() {
        let mut call = record();
        call.transition(CallState::Ringing);
        assert!(call.transition(CallState::Active));
        let stamped = call.answered_at;
        assert!(stamped.is_some());
        call.transition(CallState::Listening);
        assert_eq!(call.answered_at, stamped);
    }

    #[test]
    fn backward_transitions_are_dropped() {
        let mut call = record();
        call.transition(CallState::Answered);
        assert!(!call.transition(CallState::Ringing));
        assert!(!call.transition(CallState::Initiated));
        assert_eq!(call.state, CallState::Answered);
    }

    #[test]
    fn conversational_states_toggle() {
        let mut call = record();
        call.transition(CallState::Active);
        assert!(call.transition(CallState::Listening));
        assert!(call.transition(CallState::Speaking));
        assert!(call.transition(CallState::Listening));
        assert!(!call.transition(CallState::Active));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut call = record();
        assert!(call.finish(EndReason::Busy));
        assert_eq!(call.state, CallState::Busy);
        assert!(call.ended_at.is_some());
        assert!(!call.transition(CallState::Answered));
        assert!(!call.finish(EndReason::Completed));
        assert_eq!(call.end_reason, Some(EndReason::Busy));
    }

    #[test]
    fn state_serializes_kebab_case() {
        assert_eq!(CallState::HangupBot.to_string(), "hangup-bot");
        assert_eq!(EndReason::NoAnswer.to_string(), "no-answer");
        let json = serde_json::to_string(&CallState::NoAnswer).unwrap();
        assert_eq!(json, "\"no-answer\"");
    }

    #[test]
    fn record_serializes_camel_case() {
        let mut call = record();
        call.metadata.initial_message = Some("hi".into());
        let value = serde_json::to_value(&call).unwrap();
        assert!(value.get("callId").is_some());
        assert_eq!(value["metadata"]["initialMessage"], "hi");
        let back: CallRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.call_id, call.call_id);
    }
}
