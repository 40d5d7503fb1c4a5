//! Error types for drover.
//!
//! Uses thiserror for derive macros. `DroverError` is the top-level error that
//! maps onto process exit codes; the narrower enums below describe failures
//! that are local to one agent, plugin, message or sink and are handled
//! (logged) without ending the main loop.

use crate::exit_codes;
use thiserror::Error;

/// Main error type for drover operations.
///
/// Each variant maps to a specific exit code.
#[derive(Error, Debug)]
pub enum DroverError {
    /// User provided invalid arguments or configuration.
    #[error("{0}")]
    UserError(String),

    /// The orchestrator failed while running.
    #[error("Runtime failure: {0}")]
    RuntimeError(String),

    /// The control plane could not be bound or a request could not be completed.
    #[error("Control plane failure: {0}")]
    Control(#[from] ControlError),

    /// Another orchestrator instance holds the singleton lock.
    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    /// An agent could not be spawned.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl DroverError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            DroverError::UserError(_) => exit_codes::USER_ERROR,
            DroverError::RuntimeError(_) => exit_codes::RUNTIME_FAILURE,
            DroverError::Control(_) => exit_codes::CONTROL_FAILURE,
            DroverError::LockError(_) => exit_codes::ALREADY_RUNNING,
            DroverError::Spawn(_) => exit_codes::RUNTIME_FAILURE,
        }
    }
}

/// Result type alias for drover operations.
pub type Result<T> = std::result::Result<T, DroverError>;

/// A single inbound protocol line could not be decoded.
///
/// The reader thread logs these and moves on to the next line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failure to resolve or launch an agent entry point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("entry point '{path}' not found under trusted roots ({roots})")]
    NotFound { path: String, roots: String },

    #[error("entry point '{0}' escapes the trusted roots")]
    Traversal(String),

    #[error("invalid launch command for agent '{label}': {reason}")]
    InvalidCommand { label: String, reason: String },

    #[error("failed to launch agent '{label}': {reason}")]
    Launch { label: String, reason: String },
}

/// A plugin reduction failed while building a segment.
///
/// The segment build is aborted and its buffers are dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("reduction failed for plugin '{label}' header '{header}': {reason}")]
pub struct AggregationError {
    pub label: String,
    pub header: String,
    pub reason: String,
}

/// Misuse of the cooldown state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CooldownError {
    #[error("cooldown_seconds must be a positive number (got {0})")]
    InvalidCooldown(f64),

    #[error("close_segment called with no open segment")]
    NoOpenSegment,
}

/// Persistence failure in an output sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink '{sink}' I/O failure: {reason}")]
    Io { sink: String, reason: String },

    #[error("failed to serialize record: {0}")]
    Serialize(String),

    #[error("sink '{0}' is closed")]
    Closed(String),
}

/// Control-plane server or client failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("socket path '{path}' is {len} bytes, longer than the {max}-byte limit")]
    PathTooLong { path: String, len: usize, max: usize },

    #[error("failed to bind control socket '{path}': {reason}")]
    Bind { path: String, reason: String },

    #[error("failed to connect to '{path}': {reason}")]
    Connect { path: String, reason: String },

    #[error("control request I/O failed: {0}")]
    Io(String),

    #[error("invalid control response: {0}")]
    InvalidResponse(String),

    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("control plane is not supported on this platform")]
    Unsupported,
}
