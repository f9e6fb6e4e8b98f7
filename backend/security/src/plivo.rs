//! Plivo webhook verification (V3 preferred, V2 fallback; HMAC-SHA256).
//!
//! V3 signs a canonical URL built from the request URL and its parameters,
//! followed by `.` and the nonce. V2 signs the URL without its query string
//! concatenated with the nonce. Both are base64-encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use callforge_core::{WebhookContext, WebhookVerification};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::webhook_url::verification_url;
use crate::{constant_time_eq, form_params};

fn hmac_sha256_b64(key: &str, data: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(data.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn sorted(params: &[(String, String)]) -> Vec<(&str, &str)> {
    let mut out: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    out.sort();
    out
}

fn query_string(params: &[(String, String)]) -> String {
    sorted(params)
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical string a V3 signature covers, before the nonce.
///
/// GET requests fold every parameter into a sorted query. POST requests
/// keep the URL query sorted, then append the body parameters as sorted
/// `key + value` pairs.
fn v3_canonical_url(url: &str, method: &str, body_params: &[(String, String)]) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let mut base = format!("{}{}", parsed.origin().ascii_serialization(), parsed.path());
    let mut query: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let is_post = method.eq_ignore_ascii_case("POST") && !body_params.is_empty();
    if !is_post {
        query.extend(body_params.iter().cloned());
        let qs = query_string(&query);
        if !qs.is_empty() {
            base.push('?');
            base.push_str(&qs);
        }
        return base;
    }

    let qs = query_string(&query);
    base.push('?');
    if !qs.is_empty() {
        base.push_str(&qs);
        base.push('.');
    }
    for (k, v) in sorted(body_params) {
        base.push_str(k);
        base.push_str(v);
    }
    base
}

pub fn plivo_v3_signature(
    auth_token: &str,
    url: &str,
    method: &str,
    body_params: &[(String, String)],
    nonce: &str,
) -> String {
    let canonical = v3_canonical_url(url, method, body_params);
    hmac_sha256_b64(auth_token, &format!("{canonical}.{nonce}"))
}

pub fn plivo_v2_signature(auth_token: &str, url: &str, nonce: &str) -> String {
    let base = match Url::parse(url) {
        Ok(u) => format!("{}{}", u.origin().ascii_serialization(), u.path()),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    };
    hmac_sha256_b64(auth_token, &format!("{base}{nonce}"))
}

/// Any of the comma-separated candidates may match.
fn matches_any(expected: &str, header: &str) -> bool {
    !expected.is_empty()
        && header
            .split(',')
            .map(str::trim)
            .any(|candidate| constant_time_eq(expected.as_bytes(), candidate.as_bytes()))
}

pub fn verify_plivo_webhook(
    ctx: &WebhookContext,
    auth_token: &str,
    skip_verification: bool,
    public_url: Option<&str>,
) -> WebhookVerification {
    if skip_verification {
        return WebhookVerification::ok_with("verification skipped");
    }
    let url = verification_url(ctx, public_url);

    if let (Some(signature), Some(nonce)) = (
        ctx.header("x-plivo-signature-v3"),
        ctx.header("x-plivo-signature-v3-nonce"),
    ) {
        let body_params = if ctx.method.eq_ignore_ascii_case("POST") {
            form_params(&ctx.raw_body)
        } else {
            Vec::new()
        };
        let expected = plivo_v3_signature(auth_token, &url, &ctx.method, &body_params, nonce);
        return if matches_any(&expected, signature) {
            WebhookVerification::ok()
        } else {
            WebhookVerification::fail("Invalid Plivo V3 signature")
        };
    }

    if let (Some(signature), Some(nonce)) = (
        ctx.header("x-plivo-signature-v2"),
        ctx.header("x-plivo-signature-v2-nonce"),
    ) {
        let expected = plivo_v2_signature(auth_token, &url, nonce);
        return if matches_any(&expected, signature) {
            WebhookVerification::ok()
        } else {
            WebhookVerification::fail("Invalid Plivo V2 signature")
        };
    }

    WebhookVerification::fail("Missing Plivo signature headers")
}
