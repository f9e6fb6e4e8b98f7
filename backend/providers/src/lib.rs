//! Carrier adapters behind the `ProviderAdapter` contract, and the factory
//! that builds the configured one.

pub mod markup;
pub mod mock;
pub mod pending;
pub mod plivo;
pub mod telnyx;
pub mod twilio;

pub use mock::{MockOp, MockProvider};
pub use plivo::{PlivoOptions, PlivoProvider};
pub use telnyx::{TelnyxOptions, TelnyxProvider};
pub use twilio::{TwilioOptions, TwilioProvider};

use std::collections::HashMap;
use std::sync::Arc;

use callforge_config::VoiceCallConfig;
use callforge_core::{CallError, ProviderAdapter, ProviderKind};
use callforge_media::{MediaStreamHandler, OpenAiRealtimeStt, RealtimeSttConfig, SttProvider};
use callforge_tts::{TelephonyTts, TtsProviderKind, create_tts};
use tracing::{info, warn};

/// Live audio path handed to adapters that speak over media streams.
#[derive(Clone)]
pub struct StreamingBackend {
    pub handler: MediaStreamHandler,
    pub tts: Arc<dyn TelephonyTts>,
}

/// Build the adapter named by `config.provider`.
pub fn create_provider(
    config: &VoiceCallConfig,
    streaming: Option<StreamingBackend>,
) -> Result<Arc<dyn ProviderAdapter>, CallError> {
    let kind = config.provider.ok_or(CallError::NoProvider)?;
    let ring_timeout_secs = (config.ring_timeout_ms / 1000).max(1);
    if config.skip_signature_verification {
        warn!(provider = %kind, "Webhook signature verification is DISABLED");
    }

    let provider: Arc<dyn ProviderAdapter> = match kind {
        ProviderKind::Twilio => {
            let (Some(sid), Some(token)) = (&config.twilio.account_sid, &config.twilio.auth_token) else {
                return Err(missing("twilio.accountSid and twilio.authToken"));
            };
            let mut options = TwilioOptions::new(sid, token);
            options.webhook_url = config.webhook_url();
            options.public_url = config.public_url.clone();
            options.skip_verification = config.skip_signature_verification;
            options.allow_ngrok_free_tier_loopback_bypass = config.tunnel.allow_ngrok_free_tier_loopback_bypass;
            options.ring_timeout_secs = ring_timeout_secs;
            if config.streaming.enabled {
                options.stream_url = config.stream_url();
            }
            Arc::new(TwilioProvider::new(options, streaming))
        }
        ProviderKind::Telnyx => {
            let (Some(key), Some(connection)) = (&config.telnyx.api_key, &config.telnyx.connection_id) else {
                return Err(missing("telnyx.apiKey and telnyx.connectionId"));
            };
            let mut options = TelnyxOptions::new(key, connection);
            options.public_key = config.telnyx.public_key.clone();
            options.skip_verification = config.skip_signature_verification;
            options.ring_timeout_secs = ring_timeout_secs;
            Arc::new(TelnyxProvider::new(options))
        }
        ProviderKind::Plivo => {
            let (Some(id), Some(token)) = (&config.plivo.auth_id, &config.plivo.auth_token) else {
                return Err(missing("plivo.authId and plivo.authToken"));
            };
            let mut options = PlivoOptions::new(id, token);
            options.webhook_url = config.webhook_url();
            options.public_url = config.public_url.clone();
            options.skip_verification = config.skip_signature_verification;
            options.ring_timeout_secs = ring_timeout_secs;
            Arc::new(PlivoProvider::new(options))
        }
        ProviderKind::Mock => Arc::new(MockProvider::new()),
    };
    info!(provider = %kind, "Voice provider ready");
    Ok(provider)
}

fn missing(what: &str) -> CallError {
    CallError::Config(format!("{what} are required"))
}

/// Telephony TTS for streamed playback, if a key is available.
pub fn create_telephony_tts(config: &VoiceCallConfig) -> Option<Arc<dyn TelephonyTts>> {
    let api_key = config
        .tts
        .api_key
        .clone()
        .or_else(|| config.streaming.openai_api_key.clone())?;
    let voice = Some(config.tts.voice.clone()).filter(|v| !v.is_empty());
    let model = Some(config.tts.model.clone()).filter(|m| !m.is_empty());
    let kind = match config.tts.provider.to_ascii_lowercase().as_str() {
        "elevenlabs" => TtsProviderKind::ElevenLabs { api_key, voice_id: voice, model },
        "deepgram" => TtsProviderKind::Deepgram { api_key, voice },
        "openai" => TtsProviderKind::OpenAi { api_key, model, voice },
        other => {
            warn!(provider = other, "Unknown TTS provider, using OpenAI");
            TtsProviderKind::OpenAi { api_key, model: None, voice: None }
        }
    };
    Some(create_tts(kind))
}

/// Realtime speech-to-text for media streams, if streaming is enabled.
pub fn create_stt(config: &VoiceCallConfig) -> Option<Arc<dyn SttProvider>> {
    if !config.streaming.enabled {
        return None;
    }
    let api_key = config.streaming.openai_api_key.clone()?;
    let mut stt = RealtimeSttConfig::new(api_key);
    stt.model = config.streaming.stt_model.clone();
    stt.vad_threshold = config.streaming.vad_threshold;
    stt.silence_duration_ms = config.streaming.silence_duration_ms;
    Some(Arc::new(OpenAiRealtimeStt::new(stt)))
}

/// Fail on a non-2xx carrier response, keeping the body for the error.
pub(crate) async fn check_status(resp: reqwest::Response, carrier: &str) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{carrier} API returned {status}: {body}");
    }
    Ok(resp)
}

/// Non-empty form parameter.
pub(crate) fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_requires_a_provider() {
        let config = VoiceCallConfig::default();
        assert!(matches!(create_provider(&config, None), Err(CallError::NoProvider)));
    }

    #[test]
    fn factory_requires_credentials() {
        let config = VoiceCallConfig {
            provider: Some(ProviderKind::Twilio),
            ..Default::default()
        };
        assert!(matches!(create_provider(&config, None), Err(CallError::Config(_))));
    }

    #[test]
    fn factory_builds_each_kind() {
        let mut config = VoiceCallConfig {
            provider: Some(ProviderKind::Telnyx),
            public_url: Some("https://voice.example.com".into()),
            ..Default::default()
        };
        config.telnyx.api_key = Some("KEY".into());
        config.telnyx.connection_id = Some("conn".into());
        assert_eq!(create_provider(&config, None).unwrap().kind(), ProviderKind::Telnyx);

        config.provider = Some(ProviderKind::Mock);
        assert_eq!(create_provider(&config, None).unwrap().kind(), ProviderKind::Mock);

        config.provider = Some(ProviderKind::Plivo);
        config.plivo.auth_id = Some("MA1".into());
        config.plivo.auth_token = Some("tok".into());
        assert_eq!(create_provider(&config, None).unwrap().kind(), ProviderKind::Plivo);
    }

    #[test]
    fn tts_and_stt_need_keys() {
        let mut config = VoiceCallConfig::default();
        assert!(create_telephony_tts(&config).is_none());
        assert!(create_stt(&config).is_none());

        config.streaming.enabled = true;
        config.streaming.openai_api_key = Some("sk-test".into());
        assert_eq!(create_telephony_tts(&config).unwrap().name(), "openai");
        assert!(create_stt(&config).is_some());
    }
}
