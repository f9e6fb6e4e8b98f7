//! Telephony TTS trait and the OpenAI / ElevenLabs implementations.
//!
//! Every provider hands back 8 kHz mu-law so the media stream can frame it
//! without further conversion.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::audio::pcm16le_to_mulaw;
use crate::deepgram::{DeepgramTts, DeepgramVoice};

/// OpenAI `pcm` responses are 24 kHz 16-bit mono.
const OPENAI_PCM_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Synthesizes speech as 8 kHz mu-law bytes.
#[async_trait]
pub trait TelephonyTts: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize_for_telephony(&self, text: &str, voice: Option<&str>) -> Result<Bytes>;
}

// ---------------------------------------------------------------------------
// OpenAI TTS
// ---------------------------------------------------------------------------

pub struct OpenAiTts {
    api_key: String,
    model: String,
    default_voice: String,
    base_url: String,
    client: Client,
}

impl OpenAiTts {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "gpt-4o-mini-tts".to_string(),
            default_voice: "coral".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.default_voice = voice.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn body<'a>(&'a self, text: &'a str, voice: Option<&'a str>) -> OpenAiTtsBody<'a> {
        OpenAiTtsBody {
            model: &self.model,
            input: text,
            voice: voice.unwrap_or(&self.default_voice),
            response_format: "pcm",
        }
    }
}

#[derive(Serialize)]
struct OpenAiTtsBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

#[async_trait]
impl TelephonyTts for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize_for_telephony(&self, text: &str, voice: Option<&str>) -> Result<Bytes> {
        let body = self.body(text, voice);
        info!("[TTS/OpenAI] Synthesizing with model={} voice={}", body.model, body.voice);
        let pcm = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("OpenAI TTS request failed")?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(Bytes::from(pcm16le_to_mulaw(&pcm, OPENAI_PCM_RATE)))
    }
}

// ---------------------------------------------------------------------------
// ElevenLabs TTS
// ---------------------------------------------------------------------------

pub struct ElevenLabsTts {
    api_key: String,
    default_voice_id: String,
    model_id: String,
    base_url: String,
    client: Client,
}

impl ElevenLabsTts {
    pub fn new(api_key: String, voice_id: Option<String>) -> Self {
        Self {
            api_key,
            default_voice_id: voice_id.unwrap_or_else(|| "21m00Tcm4TlvDq8ikWAM".to_string()),
            model_id: "eleven_flash_v2_5".to_string(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            client: Client::new(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    fn url(&self, voice_id: &str) -> String {
        format!("{}/text-to-speech/{voice_id}?output_format=ulaw_8000", self.base_url)
    }
}

#[derive(Serialize)]
struct ElevenLabsBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: ElevenLabsVoiceSettings,
}

#[derive(Serialize)]
struct ElevenLabsVoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[async_trait]
impl TelephonyTts for ElevenLabsTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize_for_telephony(&self, text: &str, voice: Option<&str>) -> Result<Bytes> {
        let voice_id = voice.unwrap_or(&self.default_voice_id);
        let body = ElevenLabsBody {
            text,
            model_id: &self.model_id,
            voice_settings: ElevenLabsVoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
            },
        };
        info!("[TTS/ElevenLabs] Synthesizing voice_id={}", voice_id);
        let bytes = self
            .client
            .post(self.url(voice_id))
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("ElevenLabs TTS request failed")?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub enum TtsProviderKind {
    OpenAi { api_key: String, model: Option<String>, voice: Option<String> },
    ElevenLabs { api_key: String, voice_id: Option<String>, model: Option<String> },
    Deepgram { api_key: String, voice: Option<String> },
}

pub fn create_tts(kind: TtsProviderKind) -> Arc<dyn TelephonyTts> {
    match kind {
        TtsProviderKind::OpenAi { api_key, model, voice } => {
            let mut tts = OpenAiTts::new(api_key);
            if let Some(model) = model {
                tts = tts.with_model(model);
            }
            if let Some(voice) = voice {
                tts = tts.with_voice(voice);
            }
            Arc::new(tts)
        }
        TtsProviderKind::ElevenLabs { api_key, voice_id, model } => {
            let mut tts = ElevenLabsTts::new(api_key, voice_id);
            if let Some(model) = model {
                tts = tts.with_model(model);
            }
            Arc::new(tts)
        }
        TtsProviderKind::Deepgram { api_key, voice } => {
            let voice = voice
                .and_then(|v| v.parse::<DeepgramVoice>().ok())
                .unwrap_or_default();
            Arc::new(DeepgramTts::new(api_key).with_voice(voice))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_requests_raw_pcm() {
        let tts = OpenAiTts::new("sk".into()).with_voice("alloy");
        let body = serde_json::to_value(tts.body("hi", None)).unwrap();
        assert_eq!(body["response_format"], "pcm");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["model"], "gpt-4o-mini-tts");
        let overridden = serde_json::to_value(tts.body("hi", Some("coral"))).unwrap();
        assert_eq!(overridden["voice"], "coral");
    }

    #[test]
    fn elevenlabs_asks_for_ulaw() {
        let tts = ElevenLabsTts::new("k".into(), Some("voice-1".into()));
        assert_eq!(
            tts.url("voice-1"),
            "https://api.elevenlabs.io/v1/text-to-speech/voice-1?output_format=ulaw_8000"
        );
    }

    #[test]
    fn factory_selects_provider() {
        let tts = create_tts(TtsProviderKind::Deepgram { api_key: "k".into(), voice: Some("orion".into()) });
        assert_eq!(tts.name(), "deepgram");
        let tts = create_tts(TtsProviderKind::OpenAi { api_key: "k".into(), model: None, voice: None });
        assert_eq!(tts.name(), "openai");
    }
}
