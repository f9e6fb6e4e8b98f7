//! callforge gateway HTTP server
//!
//! Carrier webhooks, the media-stream WebSocket, and the call control API.

pub mod control_api;
pub mod runtime;
pub mod server;
pub mod webhook;
pub mod ws_server;

pub use runtime::build_state;
pub use server::{GatewayState, router, start_server};
