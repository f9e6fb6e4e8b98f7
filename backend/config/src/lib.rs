//! `callforge-config`: voice-call runtime configuration.
//!
//! Provides:
//! - Typed config schema with defaults for every section
//! - YAML read/write
//! - `${ENV_VAR}` substitution and credential env-var fallbacks
//! - Validation with per-path errors and warnings

pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use env::{apply_env_fallbacks, resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_raw_config, write_config};
pub use schema::{
    LoggingConfig, OutboundConfig, PlivoConfig, ServeConfig, StreamingConfig, TelnyxConfig,
    TtsConfig, TunnelConfig, TwilioConfig, VoiceCallConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Load a config file, substitute env vars, apply fallbacks, and validate.
///
/// This is the main entry point for loading a config at runtime.
pub async fn load_and_prepare(path: &Path) -> Result<VoiceCallConfig> {
    let raw = load_raw_config(path).await?;
    prepare(raw, &std::env::vars().collect())
}

/// The pure half of [`load_and_prepare`]: raw value plus an environment.
pub fn prepare(raw: Value, env: &HashMap<String, String>) -> Result<VoiceCallConfig> {
    let value = resolve_env_vars_with(&raw, env).context("Failed to resolve env vars in config")?;
    let mut config: VoiceCallConfig =
        serde_json::from_value(value).context("Failed to deserialize config")?;
    apply_env_fallbacks(&mut config, env);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if let Some(first) = report.errors.into_iter().next() {
        bail!(first);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callforge_core::ProviderKind;
    use serde_json::json;

    #[test]
    fn prepare_resolves_and_falls_back() {
        let raw = json!({
            "enabled": true,
            "provider": "twilio",
            "fromNumber": "${FROM}",
            "twilio": {"accountSid": "AC1"}
        });
        let env: HashMap<String, String> = [
            ("FROM".to_string(), "+15550001111".to_string()),
            ("TWILIO_AUTH_TOKEN".to_string(), "tok".to_string()),
        ]
        .into();
        let cfg = prepare(raw, &env).unwrap();
        assert_eq!(cfg.provider, Some(ProviderKind::Twilio));
        assert_eq!(cfg.from_number.as_deref(), Some("+15550001111"));
        assert_eq!(cfg.twilio.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn prepare_fails_on_validation_error() {
        let raw = json!({"enabled": true, "provider": "plivo"});
        let err = prepare(raw, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("plivo.authId"), "{err}");
    }

    #[tokio::test]
    async fn load_and_prepare_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice-call.yaml");
        tokio::fs::write(&path, "provider: mock\nmaxConcurrentCalls: 2\n").await.unwrap();
        let cfg = load_and_prepare(&path).await.unwrap();
        assert_eq!(cfg.provider, Some(ProviderKind::Mock));
        assert_eq!(cfg.max_concurrent_calls, 2);
    }
}
