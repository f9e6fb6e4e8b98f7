//! Main HTTP gateway server and routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use callforge_calls::CallManager;
use callforge_config::VoiceCallConfig;
use callforge_media::MediaStreamHandler;

use crate::{control_api, webhook, ws_server};

/// Application state shared across routes.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: CallManager,
    pub media: Option<MediaStreamHandler>,
    pub config: Arc<VoiceCallConfig>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(manager: CallManager, media: Option<MediaStreamHandler>, config: VoiceCallConfig) -> Self {
        Self {
            manager,
            media,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    let mut app = Router::new()
        .route(&state.config.serve.path, post(webhook::handle_webhook))
        .route("/api/health", get(control_api::health))
        .route("/api/calls", get(control_api::list_calls).post(control_api::create_call))
        .route("/api/calls/:id", get(control_api::get_call))
        .route("/api/calls/:id/speak", post(control_api::speak))
        .route("/api/calls/:id/continue", post(control_api::continue_call))
        .route("/api/calls/:id/end", post(control_api::end_call));

    if state.media.is_some() {
        app = app.route(&state.config.streaming.stream_path, get(ws_server::ws_handler));
    }
    app.with_state(state)
}

/// Bind and serve until ctrl-c.
#[instrument(skip(state))]
pub async fn start_server(addr: SocketAddr, state: GatewayState) -> Result<()> {
    let app = router(state.clone());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        %addr,
        webhook_path = %state.config.serve.path,
        provider = %state.manager.provider().kind(),
        "Voice gateway listening"
    );
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
