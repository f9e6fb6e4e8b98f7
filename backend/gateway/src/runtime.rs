//! Wiring a `VoiceCallConfig` into a running manager.

use anyhow::{Context, Result};
use tracing::{info, warn};

use callforge_calls::{CallManager, CallManagerConfig, CallStore};
use callforge_config::VoiceCallConfig;
use callforge_media::MediaStreamHandler;
use callforge_providers::{StreamingBackend, create_provider, create_stt, create_telephony_tts};

use crate::server::GatewayState;

/// Build the provider, media handler and call manager, replay the call log,
/// and return the state the router serves.
pub async fn build_state(config: VoiceCallConfig) -> Result<GatewayState> {
    let (media, media_events) = if config.streaming.enabled {
        let (handler, events) = MediaStreamHandler::new(create_stt(&config));
        (Some(handler), Some(events))
    } else {
        (None, None)
    };

    let backend = match (&media, create_telephony_tts(&config)) {
        (Some(handler), Some(tts)) => Some(StreamingBackend {
            handler: handler.clone(),
            tts,
        }),
        (Some(_), None) => {
            warn!("Streaming enabled without a TTS key; speech falls back to carrier TTS");
            None
        }
        _ => None,
    };
    let provider = create_provider(&config, backend)?;

    let store_dir = config.store_dir();
    let store = CallStore::open(&store_dir).with_context(|| format!("Failed to open call store {}", store_dir.display()))?;

    let mut settings = CallManagerConfig::from_config(&config);
    if settings.webhook_url.is_none() {
        let local = format!("http://{}:{}{}", config.serve.bind, config.serve.port, config.serve.path);
        warn!(url = %local, "No publicUrl configured; carriers cannot reach this webhook");
        settings.webhook_url = Some(local);
    }

    let mut builder = CallManager::builder(provider, settings).store(store);
    if let Some(handler) = &media {
        builder = builder.media(handler.clone());
    }
    let manager = builder.build();

    let recovered = manager.recover().await?;
    if recovered > 0 {
        info!(recovered, "Resumed calls from the call log");
    }
    if let Some(events) = media_events {
        manager.attach_media_events(events);
    }

    Ok(GatewayState::new(manager, media, config))
}
