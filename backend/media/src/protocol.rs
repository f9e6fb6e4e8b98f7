//! Twilio media-stream wire frames.
//!
//! Every frame is a JSON text message tagged by `event`. Audio payloads are
//! base64 8 kHz mu-law.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Frames the carrier sends us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        stream_sid: String,
        start: StartInfo,
    },
    Media {
        #[serde(default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        stream_sid: Option<String>,
        mark: MarkName,
    },
    Stop {
        #[serde(default)]
        stream_sid: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkName {
    pub name: String,
}

/// Frames we send back over the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Media { stream_sid: String, media: MediaPayload },
    Mark { stream_sid: String, mark: MarkName },
    /// Drops any audio the carrier has buffered but not yet played.
    Clear { stream_sid: String },
}

impl OutboundFrame {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload { payload, track: None },
        }
    }

    pub fn mark(stream_sid: &str, name: impl Into<String>) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkName { name: name.into() },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear { stream_sid: stream_sid.to_string() }
    }

    pub fn to_json(&self) -> String {
        // Only string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
