//! Live call audio: the carrier media-stream protocol, the per-stream TTS
//! playback queue, the stream handler, and realtime speech-to-text.

pub mod error;
pub mod protocol;
pub mod realtime;
pub mod stream;
pub mod tts_queue;

pub use error::MediaError;
pub use protocol::{InboundFrame, OutboundFrame};
pub use realtime::{
    OpenAiRealtimeStt, RealtimeSttConfig, SessionHandle, SpeechSession, SttEvent, SttProvider,
};
pub use stream::{
    MediaStreamHandler, StreamConnection, StreamEvent, StreamEventKind, StreamOutput,
};
pub use tts_queue::{PlaybackOutcome, TtsQueue};
