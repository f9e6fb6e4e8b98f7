use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no active media stream: {0}")]
    NoStream(String),

    #[error("media stream closed")]
    StreamClosed,

    #[error("malformed stream frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("speech session connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("speech session connect failed: {0}")]
    Connect(String),

    #[error("speech session gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("speech session closed")]
    SessionClosed,

    #[error("no speech-to-text provider configured")]
    NoSpeechProvider,
}
