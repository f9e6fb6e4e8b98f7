//! `callforge-calls`: the call manager, its JSONL store, and transcript
//! waiters.

pub mod manager;
pub mod responder;
pub mod store;
pub mod waiter;

pub use manager::{
    CallManager, CallManagerBuilder, CallManagerConfig, CallOptions, CallTimer, EventDisposition,
    ENDED_CACHE_SIZE,
};
pub use responder::ResponseGenerator;
pub use store::{read_history, read_records, CallStore, CALL_LOG_FILE};
pub use waiter::{TranscriptResult, TranscriptWaiters};
