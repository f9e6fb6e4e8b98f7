//! Structured logging for callforge.
//!
//! Console output plus daily-rolled NDJSON files, and redaction helpers for
//! phone numbers and credentials before they reach a log line.

pub mod logger;
pub mod redact;

pub use logger::init_logger;
pub use redact::{redact_phone, redact_sensitive_data};
