//! Local control plane.
//!
//! A Unix domain socket speaking newline-delimited JSON. Requests look like
//! `{"cmd": "...", "args": {...}, "request_id": ...}`; responses carry
//! `ok`, `cmd`, `timestamp` and either `data` or `error`.
//!
//! `ping` and `control_orchestrator{action: stop}` are answered by the
//! server itself. Everything else is forwarded to the tick loop as a
//! [`ControlRequest`].

mod client;
mod request;
mod response;
mod server;

pub use client::{ControlClient, DEFAULT_CLIENT_TIMEOUT};
pub use request::{ControlReply, ControlRequest, RequestLine};
pub use response::ControlResponse;
pub use server::{ControlServer, POLL_INTERVAL, REPLY_TIMEOUT};
