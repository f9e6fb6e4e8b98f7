//! Log Redaction
//!
//! Scrubs API keys, bearer tokens, and phone numbers from strings prior to
//! logging.

use regex::Regex;
use std::sync::LazyLock;

static TELEPHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("static regex")
});
static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9_\-]{20,})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)|(KEY[0-9A-Za-z_\-]{20,})")
        .expect("static regex")
});

/// Redacts sensitive patterns in free text.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = TELEPHONE_RE.replace_all(input, "[REDACTED_PHONE]");
    API_KEY_RE.replace_all(&redacted, "[REDACTED_TOKEN]").into_owned()
}

/// Mask a phone number down to its last four digits: `+1******4567`.
///
/// The leading `+` and country digit are kept so logs still show which
/// region a call went to.
pub fn redact_phone(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return "*".repeat(digits.len());
    }
    let plus = if number.trim_start().starts_with('+') { "+" } else { "" };
    let head: String = digits[..1].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    let hidden = "*".repeat(digits.len() - 5);
    format!("{plus}{head}{hidden}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_phone_and_bearer() {
        let raw = "Dialing +1-555-123-4567 with Bearer eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9";
        let clean = redact_sensitive_data(raw);
        assert!(!clean.contains("555-123-4567"));
        assert!(!clean.contains("eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9"));
        assert!(clean.contains("[REDACTED_PHONE]"));
    }

    #[test]
    fn redacts_openai_key() {
        let clean = redact_sensitive_data("key=sk-proj-abcdefghijklmnopqrstuvwxyz012345");
        assert_eq!(clean, "key=[REDACTED_TOKEN]");
    }

    #[test]
    fn phone_keeps_country_digit_and_last_four() {
        assert_eq!(redact_phone("+15551234567"), "+1******4567");
        assert_eq!(redact_phone("5551234567"), "5*****4567");
        assert_eq!(redact_phone("123"), "***");
    }
}
