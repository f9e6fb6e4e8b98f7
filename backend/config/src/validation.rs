//! Config validation: every problem in one pass, with the offending path.

use callforge_core::{is_e164, InboundPolicy, ProviderKind};
use thiserror::Error;

use crate::schema::VoiceCallConfig;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &VoiceCallConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_provider(config, &mut report);
    validate_numbers(config, &mut report);
    validate_limits(config, &mut report);
    validate_paths(config, &mut report);
    validate_inbound(config, &mut report);
    validate_streaming(config, &mut report);
    report
}

fn missing(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn validate_provider(config: &VoiceCallConfig, report: &mut ValidationReport) {
    let Some(provider) = config.provider else {
        if config.enabled {
            report.error("provider", "A provider is required when voice calls are enabled");
        }
        return;
    };
    match provider {
        ProviderKind::Twilio => {
            if missing(&config.twilio.account_sid) {
                report.error("twilio.accountSid", "Twilio account SID is required");
            }
            if missing(&config.twilio.auth_token) {
                report.error("twilio.authToken", "Twilio auth token is required");
            }
        }
        ProviderKind::Telnyx => {
            if missing(&config.telnyx.api_key) {
                report.error("telnyx.apiKey", "Telnyx API key is required");
            }
            if missing(&config.telnyx.connection_id) {
                report.error("telnyx.connectionId", "Telnyx connection id is required");
            }
            if missing(&config.telnyx.public_key) && !config.skip_signature_verification {
                report.error(
                    "telnyx.publicKey",
                    "Telnyx public key is required unless skipSignatureVerification is set",
                );
            }
        }
        ProviderKind::Plivo => {
            if missing(&config.plivo.auth_id) {
                report.error("plivo.authId", "Plivo auth id is required");
            }
            if missing(&config.plivo.auth_token) {
                report.error("plivo.authToken", "Plivo auth token is required");
            }
        }
        ProviderKind::Mock => {}
    }
    if config.skip_signature_verification && provider != ProviderKind::Mock {
        report.warn(
            "skipSignatureVerification",
            "Webhook signature verification is disabled; do not expose this listener publicly",
        );
    }
}

fn validate_numbers(config: &VoiceCallConfig, report: &mut ValidationReport) {
    if config.provider == Some(ProviderKind::Mock) {
        return;
    }
    if let Some(from) = &config.from_number {
        if !is_e164(from) {
            report.error("fromNumber", format!("'{from}' is not an E.164 number"));
        }
    }
    if let Some(to) = &config.to_number {
        if !is_e164(to) {
            report.warn("toNumber", format!("'{to}' is not an E.164 number"));
        }
    }
}

fn validate_limits(config: &VoiceCallConfig, report: &mut ValidationReport) {
    if config.max_concurrent_calls == 0 {
        report.error("maxConcurrentCalls", "maxConcurrentCalls must be >= 1");
    }
    if config.max_duration_seconds == 0 {
        report.error("maxDurationSeconds", "maxDurationSeconds must be > 0");
    }
    if config.transcript_timeout_ms == 0 {
        report.error("transcriptTimeoutMs", "transcriptTimeoutMs must be > 0");
    }
}

fn validate_paths(config: &VoiceCallConfig, report: &mut ValidationReport) {
    if !config.serve.path.starts_with('/') {
        report.error("serve.path", "serve.path must be a non-empty absolute path");
    }
    if config.streaming.enabled && !config.streaming.stream_path.starts_with('/') {
        report.error("streaming.streamPath", "streamPath must be a non-empty absolute path");
    }
    if config.serve.port < 1024 {
        report.warn(
            "serve.port",
            format!("Port {} requires elevated privileges; consider a port >= 1024", config.serve.port),
        );
    }
}

fn validate_inbound(config: &VoiceCallConfig, report: &mut ValidationReport) {
    match config.inbound_policy {
        InboundPolicy::Open => {
            report.warn("inboundPolicy", "Inbound policy is open; any caller gets a call record");
        }
        InboundPolicy::Allowlist | InboundPolicy::Pairing if config.allow_from.is_empty() => {
            report.warn("allowFrom", "Allowlist policy with no entries rejects every caller");
        }
        _ => {}
    }
}

fn validate_streaming(config: &VoiceCallConfig, report: &mut ValidationReport) {
    if !config.streaming.enabled {
        return;
    }
    if config.provider.is_some_and(|p| p != ProviderKind::Twilio) {
        report.warn("streaming.enabled", "Media streaming is only used by the Twilio provider");
    }
    if missing(&config.streaming.openai_api_key) {
        report.error("streaming.openaiApiKey", "Streaming transcription requires an OpenAI API key");
    }
    if !(0.0..=1.0).contains(&config.streaming.vad_threshold) {
        report.error("streaming.vadThreshold", "vadThreshold must be between 0 and 1");
    }
}
