//! Voice-call runtime configuration schema.
//!
//! Keys are camelCase on disk. Every section defaults, so a minimal YAML
//! file only names the provider and its credentials.

use std::path::PathBuf;

use callforge_core::{CallMode, InboundPolicy, ProviderKind};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceCallConfig {
    pub enabled: bool,

    /// Active carrier backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,

    /// Caller id for outbound calls (E.164).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_number: Option<String>,

    /// Default destination when `call` is issued without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_number: Option<String>,

    pub inbound_policy: InboundPolicy,
    pub allow_from: Vec<String>,

    /// Spoken to accepted inbound callers on answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_greeting: Option<String>,

    pub outbound: OutboundConfig,

    pub max_duration_seconds: u64,
    pub transcript_timeout_ms: u64,
    pub ring_timeout_ms: u64,
    pub max_concurrent_calls: usize,

    pub serve: ServeConfig,

    /// Externally reachable base URL (tunnel or reverse proxy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    pub skip_signature_verification: bool,

    pub tunnel: TunnelConfig,
    pub streaming: StreamingConfig,
    pub tts: TtsConfig,

    pub telnyx: TelnyxConfig,
    pub twilio: TwilioConfig,
    pub plivo: PlivoConfig,

    /// Directory holding `calls.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,

    pub logging: LoggingConfig,
}

impl Default for VoiceCallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            from_number: None,
            to_number: None,
            inbound_policy: InboundPolicy::Disabled,
            allow_from: Vec::new(),
            inbound_greeting: None,
            outbound: OutboundConfig::default(),
            max_duration_seconds: 300,
            transcript_timeout_ms: 180_000,
            ring_timeout_ms: 30_000,
            max_concurrent_calls: 1,
            serve: ServeConfig::default(),
            public_url: None,
            skip_signature_verification: false,
            tunnel: TunnelConfig::default(),
            streaming: StreamingConfig::default(),
            tts: TtsConfig::default(),
            telnyx: TelnyxConfig::default(),
            twilio: TwilioConfig::default(),
            plivo: PlivoConfig::default(),
            store: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl VoiceCallConfig {
    /// Call store directory, defaulting to `<config dir>/voice-calls`.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| crate::io::config_dir().join("voice-calls"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| self.store_dir().join("logs"))
    }

    /// Public URL of the webhook endpoint, if one is known.
    pub fn webhook_url(&self) -> Option<String> {
        let base = self.public_url.as_deref()?.trim_end_matches('/');
        if base.ends_with(self.serve.path.as_str()) {
            return Some(base.to_string());
        }
        Some(format!("{base}{}", self.serve.path))
    }

    /// `wss://` URL carriers should open for media streaming.
    pub fn stream_url(&self) -> Option<String> {
        let public = self.public_url.as_deref()?;
        let (scheme, rest) = public.split_once("://")?;
        let ws_scheme = if scheme.eq_ignore_ascii_case("https") { "wss" } else { "ws" };
        let host = rest.split('/').next()?;
        Some(format!("{ws_scheme}://{host}{}", self.streaming.stream_path))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundConfig {
    pub default_mode: CallMode,
    /// Seconds between the notify message finishing and the bot hanging up.
    pub notify_hangup_delay_sec: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            default_mode: CallMode::Notify,
            notify_hangup_delay_sec: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServeConfig {
    pub port: u16,
    pub bind: String,
    pub path: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 3334,
            bind: "127.0.0.1".to_string(),
            path: "/voice/webhook".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelConfig {
    /// Informational: `ngrok`, `tailscale`, ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Accept Twilio signature mismatches from a local ngrok free-tier agent.
    pub allow_ngrok_free_tier_loopback_bypass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub stream_path: String,
    pub stt_model: String,
    pub vad_threshold: f32,
    pub silence_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stream_path: "/voice/stream".to_string(),
            stt_model: "gpt-4o-transcribe".to_string(),
            vad_threshold: 0.5,
            silence_duration_ms: 800,
            openai_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtsConfig {
    /// `openai`, `elevenlabs`, or `deepgram`.
    pub provider: String,
    pub voice: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            voice: "coral".to_string(),
            model: "gpt-4o-mini-tts".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelnyxConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Base64 Ed25519 key used to verify webhooks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TwilioConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlivoConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = "provider: twilio\nfromNumber: \"+15550001111\"\n";
        let cfg: VoiceCallConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.provider, Some(ProviderKind::Twilio));
        assert_eq!(cfg.max_duration_seconds, 300);
        assert_eq!(cfg.transcript_timeout_ms, 180_000);
        assert_eq!(cfg.max_concurrent_calls, 1);
        assert_eq!(cfg.outbound.notify_hangup_delay_sec, 3);
        assert_eq!(cfg.serve.path, "/voice/webhook");
        assert_eq!(cfg.streaming.stt_model, "gpt-4o-transcribe");
        assert_eq!(cfg.tts.voice, "coral");
        assert_eq!(cfg.inbound_policy, InboundPolicy::Disabled);
    }

    #[test]
    fn nested_sections_use_camel_case() {
        let yaml = r#"
outbound:
  defaultMode: conversation
tunnel:
  allowNgrokFreeTierLoopbackBypass: true
streaming:
  enabled: true
  silenceDurationMs: 500
"#;
        let cfg: VoiceCallConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.outbound.default_mode, CallMode::Conversation);
        assert!(cfg.tunnel.allow_ngrok_free_tier_loopback_bypass);
        assert!(cfg.streaming.enabled);
        assert_eq!(cfg.streaming.silence_duration_ms, 500);
        assert_eq!(cfg.streaming.stream_path, "/voice/stream");
    }

    #[test]
    fn derives_webhook_and_stream_urls() {
        let cfg = VoiceCallConfig {
            public_url: Some("https://abc.ngrok-free.app/".into()),
            ..Default::default()
        };
        assert_eq!(cfg.webhook_url().as_deref(), Some("https://abc.ngrok-free.app/voice/webhook"));
        assert_eq!(cfg.stream_url().as_deref(), Some("wss://abc.ngrok-free.app/voice/stream"));

        let full = VoiceCallConfig {
            public_url: Some("https://voice.example.com/voice/webhook".into()),
            ..Default::default()
        };
        assert_eq!(full.webhook_url().as_deref(), Some("https://voice.example.com/voice/webhook"));
        assert!(VoiceCallConfig::default().webhook_url().is_none());
    }
}
