//! # mailcheck-server
//!
//! Streaming mail-server health checks over WebSocket. A client sends
//! `{"domain": "..."}`; the server applies a per-client sliding-window rate
//! limit, waits for a slot on a global admission gate, runs the external
//! check routine under a timeout and streams progress and the result back.

pub mod config;
pub mod server;
pub mod utils;
