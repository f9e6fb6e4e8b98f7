//! Carrier webhook endpoint.
//!
//! Verifies the request, hands it to the adapter for normalization, feeds
//! every event to the call manager, and returns the adapter's response.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, OriginalUri, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use callforge_calls::EventDisposition;
use callforge_core::{EndReason, HangupCallInput, WebhookContext, WebhookParseResult};
use callforge_security::webhook_url::reconstruct_request_url;

use crate::server::GatewayState;

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

pub fn webhook_context(
    method: &Method,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    query: HashMap<String, String>,
    remote: Option<SocketAddr>,
    body: String,
) -> WebhookContext {
    let headers = lowercase_headers(headers);
    let path_and_query = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    WebhookContext {
        url: reconstruct_request_url(&headers, path_and_query),
        headers,
        raw_body: body,
        method: method.as_str().to_string(),
        query,
        remote_address: remote.map(|addr| addr.ip().to_string()),
    }
}

fn render(result: WebhookParseResult) -> Response {
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, result.response_body.unwrap_or_default()).into_response();
    for (name, value) in result.response_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Handler for `POST {serve.path}`.
pub async fn handle_webhook(
    State(state): State<GatewayState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
    body: String,
) -> Response {
    let ctx = webhook_context(&method, &uri, &headers, query, remote.map(|ConnectInfo(addr)| addr), body);
    let provider = state.manager.provider().clone();

    let verification = provider.verify_webhook(&ctx);
    if !verification.ok {
        warn!(
            provider = %provider.kind(),
            reason = verification.reason.as_deref().unwrap_or("unknown"),
            "Webhook verification failed"
        );
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    if let Some(reason) = &verification.reason {
        debug!(provider = %provider.kind(), reason = %reason, "Webhook accepted");
    }

    let parsed = provider.parse_webhook_event(&ctx);
    let events = parsed.events.clone();
    for event in events {
        let provider_call_id = event.provider_call_id.clone();
        if state.manager.process_event(event).await != EventDisposition::Rejected {
            continue;
        }
        if let Some(rejection) = provider.rejection_response() {
            return render(rejection);
        }
        // Carriers without a markup reply get an explicit hangup.
        if let Some(provider_call_id) = provider_call_id {
            let provider = provider.clone();
            tokio::spawn(async move {
                let input = HangupCallInput {
                    call_id: String::new(),
                    provider_call_id,
                    reason: EndReason::Failed,
                };
                if let Err(e) = provider.hangup_call(input).await {
                    warn!(error = %e, "Failed to hang up rejected inbound call");
                }
            });
        }
    }

    render(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_rebuilds_forwarded_url() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-Proto", HeaderValue::from_static("https"));
        headers.insert("X-Forwarded-Host", HeaderValue::from_static("voice.example.com"));
        let uri: axum::http::Uri = "/voice/webhook?flow=status&callId=c1".parse().unwrap();
        let ctx = webhook_context(
            &Method::POST,
            &uri,
            &headers,
            HashMap::from([("flow".to_string(), "status".to_string())]),
            Some("127.0.0.1:5000".parse().unwrap()),
            "CallSid=CA1".into(),
        );
        assert_eq!(ctx.url, "https://voice.example.com/voice/webhook?flow=status&callId=c1");
        assert_eq!(ctx.header("X-Forwarded-Host"), Some("voice.example.com"));
        assert_eq!(ctx.remote_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(ctx.query_param("flow"), Some("status"));
    }

    #[test]
    fn render_copies_status_and_headers() {
        let response = render(WebhookParseResult::xml(Vec::new(), "<Response/>".into()));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/xml");
        assert_eq!(render(WebhookParseResult::bad_request("nope")).status(), StatusCode::BAD_REQUEST);
    }
}
