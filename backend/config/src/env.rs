//! Environment handling for the config file.
//!
//! Two mechanisms, applied in order:
//! 1. `${VAR}` references inside string values are substituted
//!    (`$${VAR}` keeps a literal `${VAR}`). Names are `[A-Z_][A-Z0-9_]*`.
//! 2. Carrier and OpenAI credentials left unset fall back to their
//!    conventional variables (`TWILIO_AUTH_TOKEN`, `OPENAI_API_KEY`, ...).

use std::collections::HashMap;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::schema::VoiceCallConfig;

/// Matches `${VAR}` and its escaped form `$${VAR}`.
static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?)\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex"));

#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute `${VAR}` references from the process environment.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    resolve_env_vars_with(value, &std::env::vars().collect())
}

/// Substitute `${VAR}` references from `env`. Unset or empty variables are
/// an error naming the config path.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    substitute(value, env, "")
}

fn substitute(value: &Value, env: &HashMap<String, String>, path: &str) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_str(s, env, path)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| substitute(v, env, &format!("{path}[{i}]")))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                let child = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                out.insert(key.clone(), substitute(v, env, &child)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn substitute_str(s: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !s.contains("${") {
        return Ok(s.to_string());
    }
    let mut missing = None;
    let out = REFERENCE.replace_all(s, |caps: &Captures| {
        let name = &caps[2];
        if !caps[1].is_empty() {
            return format!("${{{name}}}");
        }
        match env.get(name).filter(|v| !v.is_empty()) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(var_name) = missing {
        bail!(MissingEnvVarError {
            var_name,
            config_path: path.to_string(),
        });
    }
    Ok(out.into_owned())
}

/// Fill unset credentials from the conventional environment variables.
pub fn apply_env_fallbacks(config: &mut VoiceCallConfig, env: &HashMap<String, String>) {
    let lookup = |name: &str| env.get(name).filter(|v| !v.trim().is_empty()).cloned();
    let fill = |slot: &mut Option<String>, name: &str| {
        if slot.as_deref().map_or(true, |v| v.trim().is_empty()) {
            if let Some(v) = lookup(name) {
                *slot = Some(v);
            }
        }
    };

    fill(&mut config.telnyx.api_key, "TELNYX_API_KEY");
    fill(&mut config.telnyx.connection_id, "TELNYX_CONNECTION_ID");
    fill(&mut config.telnyx.public_key, "TELNYX_PUBLIC_KEY");
    fill(&mut config.twilio.account_sid, "TWILIO_ACCOUNT_SID");
    fill(&mut config.twilio.auth_token, "TWILIO_AUTH_TOKEN");
    fill(&mut config.plivo.auth_id, "PLIVO_AUTH_ID");
    fill(&mut config.plivo.auth_token, "PLIVO_AUTH_TOKEN");
    fill(&mut config.streaming.openai_api_key, "OPENAI_API_KEY");
    if config.tts.provider == "openai" {
        fill(&mut config.tts.api_key, "OPENAI_API_KEY");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_nested_references() {
        let v = json!({"twilio": {"authToken": "${TW_TOKEN}"}, "allowFrom": ["+1${AREA}0000000"]});
        let out = resolve_env_vars_with(&v, &env(&[("TW_TOKEN", "secret"), ("AREA", "555")])).unwrap();
        assert_eq!(out["twilio"]["authToken"], "secret");
        assert_eq!(out["allowFrom"][0], "+15550000000");
    }

    #[test]
    fn missing_var_names_the_path() {
        let v = json!({"telnyx": {"apiKey": "${NOPE}"}});
        let err = resolve_env_vars_with(&v, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("NOPE"));
        assert!(err.contains("telnyx.apiKey"));
    }

    #[test]
    fn escaped_reference_is_kept_literally() {
        let v = json!({"inboundGreeting": "say $${NAME} and ${WHO}"});
        let out = resolve_env_vars_with(&v, &env(&[("WHO", "bob")])).unwrap();
        assert_eq!(out["inboundGreeting"], "say ${NAME} and bob");
    }

    #[test]
    fn fallbacks_fill_only_unset_credentials() {
        let mut cfg = VoiceCallConfig::default();
        cfg.twilio.account_sid = Some("AC-from-file".into());
        apply_env_fallbacks(
            &mut cfg,
            &env(&[
                ("TWILIO_ACCOUNT_SID", "AC-from-env"),
                ("TWILIO_AUTH_TOKEN", "tok"),
                ("OPENAI_API_KEY", "sk-1"),
            ]),
        );
        assert_eq!(cfg.twilio.account_sid.as_deref(), Some("AC-from-file"));
        assert_eq!(cfg.twilio.auth_token.as_deref(), Some("tok"));
        assert_eq!(cfg.streaming.openai_api_key.as_deref(), Some("sk-1"));
        assert_eq!(cfg.tts.api_key.as_deref(), Some("sk-1"));
        assert!(cfg.plivo.auth_id.is_none());
    }
}
