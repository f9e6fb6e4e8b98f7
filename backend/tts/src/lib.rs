pub mod audio;
pub mod deepgram;
pub mod engine;

pub use audio::{
    chunk_frames, downsample, linear_to_mulaw, mulaw_to_linear, pcm16le_to_mulaw, MULAW_FRAME_BYTES,
    MULAW_SAMPLE_RATE,
};
pub use deepgram::{DeepgramTts, DeepgramVoice};
pub use engine::{create_tts, ElevenLabsTts, OpenAiTts, TelephonyTts, TtsProviderKind};
