//! Call control REST API.
//!
//! Mutating endpoints answer with `{success, callId?, transcript?, error?}`.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use callforge_calls::CallOptions;
use callforge_core::{CallError, CallMode, CallRecord};

use crate::server::GatewayState;

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    fn ok(call_id: impl Into<String>) -> Self {
        Self {
            success: true,
            call_id: Some(call_id.into()),
            ..Default::default()
        }
    }
}

fn status_for(err: &CallError) -> StatusCode {
    match err {
        CallError::CallNotFound(_) => StatusCode::NOT_FOUND,
        CallError::ConcurrencyLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        CallError::NotConnected(_) | CallError::AlreadyEnded(_) => StatusCode::CONFLICT,
        CallError::Config(_) | CallError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        CallError::TranscriptTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CallError::Provider { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(call_id: Option<String>, err: CallError) -> Response {
    let body = ControlResponse {
        success: false,
        call_id,
        transcript: None,
        error: Some(err.to_string()),
    };
    (status_for(&err), Json(body)).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub provider: String,
    pub active_calls: usize,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Handler for `GET /api/health`
pub async fn health(State(state): State<GatewayState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".into(),
        provider: state.manager.provider().kind().to_string(),
        active_calls: state.manager.active_calls().len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}

/// Handler for `GET /api/calls`
pub async fn list_calls(State(state): State<GatewayState>) -> Json<Vec<CallRecord>> {
    Json(state.manager.active_calls())
}

/// Handler for `GET /api/calls/:id`
pub async fn get_call(State(state): State<GatewayState>, Path(call_id): Path<String>) -> Response {
    match state.manager.get_call(&call_id) {
        Some(call) => Json(call).into_response(),
        None => failure(Some(call_id.clone()), CallError::CallNotFound(call_id)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub to: Option<String>,
    pub message: Option<String>,
    pub mode: Option<CallMode>,
    pub session_key: Option<String>,
}

/// Handler for `POST /api/calls`
pub async fn create_call(State(state): State<GatewayState>, Json(req): Json<CreateCallRequest>) -> Response {
    let Some(to) = req.to.or_else(|| state.config.to_number.clone()) else {
        return failure(None, CallError::InvalidPayload("`to` is required".into()));
    };
    let options = CallOptions {
        message: req.message,
        mode: req.mode,
    };
    match state.manager.initiate_call(&to, req.session_key, options).await {
        Ok(call_id) => {
            info!(call_id = %call_id, "Call requested over control API");
            Json(ControlResponse::ok(call_id)).into_response()
        }
        Err(e) => failure(None, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
}

/// Handler for `POST /api/calls/:id/speak`
pub async fn speak(
    State(state): State<GatewayState>,
    Path(call_id): Path<String>,
    Json(req): Json<SpeakRequest>,
) -> Response {
    match state.manager.speak(&call_id, &req.text).await {
        Ok(()) => Json(ControlResponse::ok(call_id)).into_response(),
        Err(e) => failure(Some(call_id), e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ContinueRequest {
    pub prompt: Option<String>,
}

/// Handler for `POST /api/calls/:id/continue`: speak, then wait for the reply.
pub async fn continue_call(
    State(state): State<GatewayState>,
    Path(call_id): Path<String>,
    Json(req): Json<ContinueRequest>,
) -> Response {
    match state.manager.listen_and_wait(&call_id, req.prompt.as_deref()).await {
        Ok(transcript) => Json(ControlResponse {
            transcript: Some(transcript),
            ..ControlResponse::ok(call_id)
        })
        .into_response(),
        Err(e) => failure(Some(call_id), e),
    }
}

/// Handler for `POST /api/calls/:id/end`
pub async fn end_call(State(state): State<GatewayState>, Path(call_id): Path<String>) -> Response {
    match state.manager.end_call(&call_id).await {
        Ok(()) => Json(ControlResponse::ok(call_id)).into_response(),
        Err(e) => failure(Some(call_id), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&CallError::CallNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CallError::ConcurrencyLimit(1)), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&CallError::TranscriptTimeout(10)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&CallError::NoWebhookUrl), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_value(ControlResponse::ok("c1")).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true, "callId": "c1" }));
    }
}
