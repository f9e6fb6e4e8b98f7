//! Webhook authenticity checks for each carrier, plus the inbound caller
//! acceptance policy.
//!
//! Every verifier honours a skip flag for local development and compares
//! signatures in constant time.

pub mod inbound_policy;
pub mod plivo;
pub mod telnyx;
pub mod twilio;
pub mod webhook_url;

pub use inbound_policy::InboundAcceptance;
pub use plivo::{plivo_v2_signature, plivo_v3_signature, verify_plivo_webhook};
pub use telnyx::{verify_telnyx_webhook, verify_telnyx_webhook_at, TELNYX_MAX_SKEW_SECS};
pub use twilio::{twilio_signature, verify_twilio_webhook, TwilioVerifyOptions};
pub use webhook_url::{is_loopback_address, is_ngrok_free_tier_url, verification_url};

use subtle::ConstantTimeEq;

/// Compare two signatures without leaking the mismatch position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Decode an `application/x-www-form-urlencoded` body into ordered pairs.
pub fn form_params(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_requires_equal_length() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn form_params_decode_plus_and_percent() {
        let params = form_params("SpeechResult=hello+there&From=%2B15550001111");
        assert_eq!(params[0], ("SpeechResult".into(), "hello there".into()));
        assert_eq!(params[1], ("From".into(), "+15550001111".into()));
    }
}
