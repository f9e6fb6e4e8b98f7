//! Rebuilding the URL a carrier signed, and the narrow checks behind the
//! ngrok loopback bypass.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use callforge_core::WebhookContext;
use url::Url;

/// Free-tier ngrok host suffixes. The free tier rewrites forwarding headers,
/// which breaks URL-based signatures.
const NGROK_FREE_TIER_SUFFIXES: [&str; 3] = [".ngrok-free.app", ".ngrok-free.dev", ".ngrok.io"];

/// Rebuild the externally visible request URL from proxy headers.
///
/// `headers` must have lowercased names.
pub fn reconstruct_request_url(headers: &HashMap<String, String>, path_and_query: &str) -> String {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let scheme = first("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = first("x-forwarded-host")
        .or_else(|| first("host"))
        .unwrap_or_else(|| "localhost".to_string());
    format!("{scheme}://{host}{path_and_query}")
}

/// The URL to verify a signature against.
///
/// With a configured public URL, its origin replaces whatever the proxy
/// chain reported; path and query always come from the request itself.
pub fn verification_url(ctx: &WebhookContext, public_url: Option<&str>) -> String {
    let Some(public) = public_url.and_then(|u| Url::parse(u).ok()) else {
        return ctx.url.clone();
    };
    let Ok(request) = Url::parse(&ctx.url) else {
        return ctx.url.clone();
    };
    let mut out = public.origin().ascii_serialization();
    out.push_str(request.path());
    if let Some(query) = request.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

pub fn is_ngrok_free_tier_url(url: &str) -> bool {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    NGROK_FREE_TIER_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

/// Accepts a bare IP or an `ip:port` socket address.
pub fn is_loopback_address(address: &str) -> bool {
    let trimmed = address.trim();
    let ip = trimmed
        .parse::<IpAddr>()
        .ok()
        .or_else(|| trimmed.parse::<SocketAddr>().ok().map(|s| s.ip()));
    match ip {
        Some(IpAddr::V4(v4)) => v4.is_loopback(),
        Some(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        None => false,
    }
}
