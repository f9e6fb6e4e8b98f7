use thiserror::Error;

/// Top-level error type for call orchestration.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("no voice provider configured")]
    NoProvider,

    #[error("webhook URL not configured")]
    NoWebhookUrl,

    #[error("fromNumber not configured")]
    NoFromNumber,

    #[error("maximum concurrent calls reached ({0})")]
    ConcurrencyLimit(usize),

    #[error("call not found: {0}")]
    CallNotFound(String),

    #[error("call not connected: {0}")]
    NotConnected(String),

    #[error("call already ended: {0}")]
    AlreadyEnded(String),

    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("timed out waiting for transcript after {0}ms")]
    TranscriptTimeout(u64),

    #[error("transcript wait cancelled: {0}")]
    WaitCancelled(String),

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    pub fn provider(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: err.to_string(),
        }
    }
}
