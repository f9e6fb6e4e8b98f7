//! `callforge-core`: call records, the call state machine, canonical call
//! events, and the contract every carrier adapter implements.

pub mod error;
pub mod event;
pub mod phone;
pub mod traits;
pub mod types;

pub use error::CallError;
pub use event::{CallEvent, CallEventKind};
pub use phone::{is_e164, normalize_digits};
pub use traits::{
    HangupCallInput, InitiateCallInput, InitiateCallResult, PlayTtsInput, ProviderAdapter,
    ProviderCallStatus, StartListeningInput, StopListeningInput, WebhookContext,
    WebhookParseResult, WebhookVerification,
};
pub use types::{
    CallDirection, CallId, CallMetadata, CallMode, CallRecord, CallState, EndReason,
    InboundPolicy, ProviderKind, Speaker, TranscriptEntry,
};
