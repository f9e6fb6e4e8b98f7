//! Deepgram Aura TTS, requested directly as headerless 8 kHz mu-law.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::TelephonyTts;

/// Deepgram Aura TTS voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeepgramVoice {
    #[default]
    Asteria,
    Orion,
    Luna,
    Stella,
    Athena,
    Hera,
    Orpheus,
    Helios,
}

impl DeepgramVoice {
    pub fn as_model_name(&self) -> &'static str {
        match self {
            Self::Asteria => "aura-asteria-en",
            Self::Orion   => "aura-orion-en",
            Self::Luna    => "aura-luna-en",
            Self::Stella  => "aura-stella-en",
            Self::Athena  => "aura-athena-en",
            Self::Hera    => "aura-hera-en",
            Self::Orpheus => "aura-orpheus-en",
            Self::Helios  => "aura-helios-en",
        }
    }
}

impl FromStr for DeepgramVoice {
    type Err = String;

    /// Accepts `orion` as well as the full `aura-orion-en` model name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let short = name
            .strip_prefix("aura-")
            .and_then(|n| n.strip_suffix("-en"))
            .unwrap_or(&name);
        serde_json::from_value(serde_json::Value::String(short.to_string()))
            .map_err(|_| format!("unknown Deepgram voice: {s}"))
    }
}

pub struct DeepgramTts {
    client: Client,
    api_key: String,
    voice: DeepgramVoice,
    base_url: String,
}

impl DeepgramTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            voice: DeepgramVoice::default(),
            base_url: "https://api.deepgram.com/v1/speak".to_string(),
        }
    }

    pub fn with_voice(mut self, voice: DeepgramVoice) -> Self {
        self.voice = voice;
        self
    }

    fn url(&self, voice: DeepgramVoice) -> String {
        format!(
            "{}?model={}&encoding=mulaw&sample_rate=8000&container=none",
            self.base_url,
            voice.as_model_name(),
        )
    }
}

#[async_trait]
impl TelephonyTts for DeepgramTts {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn synthesize_for_telephony(&self, text: &str, voice: Option<&str>) -> Result<Bytes> {
        let voice = voice
            .and_then(|v| v.parse::<DeepgramVoice>().ok())
            .unwrap_or(self.voice);

        #[derive(Serialize)]
        struct Body<'a> {
            text: &'a str,
        }

        info!("[TTS/Deepgram] Synthesizing model={}", voice.as_model_name());
        let resp = self
            .client
            .post(self.url(voice))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&Body { text })
            .send()
            .await
            .context("Deepgram TTS request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Deepgram TTS error {status}: {body}");
        }
        Ok(resp.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_model_names() {
        assert_eq!("orion".parse::<DeepgramVoice>().unwrap(), DeepgramVoice::Orion);
        assert_eq!("aura-luna-en".parse::<DeepgramVoice>().unwrap(), DeepgramVoice::Luna);
        assert!("nobody".parse::<DeepgramVoice>().is_err());
    }

    #[test]
    fn url_requests_headerless_mulaw() {
        let tts = DeepgramTts::new("k");
        assert_eq!(
            tts.url(DeepgramVoice::Asteria),
            "https://api.deepgram.com/v1/speak?model=aura-asteria-en&encoding=mulaw&sample_rate=8000&container=none"
        );
    }
}
