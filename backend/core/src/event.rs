use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CallDirection, EndReason};

/// Provider-agnostic call event. Every adapter normalizes its carrier's
/// webhook dialect into a batch of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    /// Idempotency key. Redelivered webhooks must produce the same id.
    pub id: String,
    /// Engine call id when the carrier echoes it back; absent on the first
    /// event of an inbound call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CallDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub kind: CallEventKind,
}

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CallEventKind {
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking {
        #[serde(default)]
        text: Option<String>,
    },
    Speech {
        transcript: String,
        #[serde(default = "default_true")]
        is_final: bool,
        #[serde(default)]
        confidence: Option<f32>,
    },
    Silence {
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    Dtmf {
        digits: String,
    },
    Ended {
        reason: EndReason,
    },
    Error {
        error: String,
        #[serde(default)]
        retryable: bool,
    },
}

fn default_true() -> bool {
    true
}

impl CallEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Active => "active",
            Self::Speaking { .. } => "speaking",
            Self::Speech { .. } => "speech",
            Self::Silence { .. } => "silence",
            Self::Dtmf { .. } => "dtmf",
            Self::Ended { .. } => "ended",
            Self::Error { .. } => "error",
        }
    }
}

impl CallEvent {
    /// Build an event with a fresh random id.
    pub fn new(kind: CallEventKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: CallEventKind) -> Self {
        Self {
            id: id.into(),
            call_id: None,
            provider_call_id: None,
            timestamp: Utc::now(),
            direction: None,
            from: None,
            to: None,
            kind,
        }
    }

    pub fn for_call(mut self, call_id: Option<String>) -> Self {
        self.call_id = call_id.filter(|id| !id.is_empty());
        self
    }

    pub fn for_provider_call(mut self, provider_call_id: impl Into<String>) -> Self {
        let id = provider_call_id.into();
        self.provider_call_id = (!id.is_empty()).then_some(id);
        self
    }

    pub fn with_parties(
        mut self,
        direction: Option<CallDirection>,
        from: Option<String>,
        to: Option<String>,
    ) -> Self {
        self.direction = direction;
        self.from = from;
        self.to = to;
        self
    }
}
