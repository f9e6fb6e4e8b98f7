//! Telnyx webhook verification (Ed25519 over `timestamp|body`).
//!
//! Telnyx signs `"{telnyx-timestamp}|{raw body}"` and sends the signature
//! base64-encoded in `telnyx-signature-ed25519`. The account public key is
//! configured base64-encoded. Freshness is checked separately from the
//! signature so a captured request cannot be replayed later.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use callforge_core::{WebhookContext, WebhookVerification};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Maximum accepted distance between the signed timestamp and now.
pub const TELNYX_MAX_SKEW_SECS: i64 = 300;

pub fn verify_telnyx_webhook(
    ctx: &WebhookContext,
    public_key: Option<&str>,
    skip_verification: bool,
) -> WebhookVerification {
    verify_telnyx_webhook_at(ctx, public_key, skip_verification, Utc::now().timestamp())
}

/// Same as [`verify_telnyx_webhook`] with an explicit clock, in unix seconds.
pub fn verify_telnyx_webhook_at(
    ctx: &WebhookContext,
    public_key: Option<&str>,
    skip_verification: bool,
    now_secs: i64,
) -> WebhookVerification {
    if skip_verification {
        return WebhookVerification::ok_with("verification skipped");
    }
    let Some(public_key) = public_key.filter(|k| !k.trim().is_empty()) else {
        return WebhookVerification::fail("Telnyx public key not configured");
    };
    let (Some(signature), Some(timestamp)) =
        (ctx.header("telnyx-signature-ed25519"), ctx.header("telnyx-timestamp"))
    else {
        return WebhookVerification::fail("Missing Telnyx signature headers");
    };

    let Ok(signed_at) = timestamp.trim().parse::<i64>() else {
        return WebhookVerification::fail("Malformed telnyx-timestamp header");
    };
    if (now_secs - signed_at).abs() > TELNYX_MAX_SKEW_SECS {
        return WebhookVerification::fail("Telnyx timestamp outside the 5 minute window");
    }

    let key = match decode_fixed::<32>(public_key) {
        Some(bytes) => match VerifyingKey::from_bytes(&bytes) {
            Ok(key) => key,
            Err(_) => return WebhookVerification::fail("Invalid Telnyx public key"),
        },
        None => return WebhookVerification::fail("Invalid Telnyx public key"),
    };
    let Some(sig_bytes) = decode_fixed::<64>(signature) else {
        return WebhookVerification::fail("Malformed Telnyx signature");
    };
    let signature = Signature::from_bytes(&sig_bytes);

    let message = format!("{}|{}", timestamp.trim(), ctx.raw_body);
    match key.verify(message.as_bytes(), &signature) {
        Ok(()) => WebhookVerification::ok(),
        Err(_) => WebhookVerification::fail("Invalid Telnyx signature"),
    }
}

fn decode_fixed<const N: usize>(value: &str) -> Option<[u8; N]> {
    STANDARD.decode(value.trim()).ok()?.try_into().ok()
}
