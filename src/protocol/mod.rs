//! Wire protocol spoken between drover and its agents.
//!
//! Both directions use newline-delimited UTF-8 JSON, one object per line:
//!
//! - agent → orchestrator: [`AgentMessage`], a closed tagged variant decided
//!   once at parse time from the `type` field
//! - orchestrator → agent: [`OrchestratorCommand`], `{"cmd": .., "args": {..}}`
//!   with an optional correlation `id` and, for `sequence`, an ordered list of
//!   sub-commands the agent executes atomically
//!
//! Decoding is forward compatible: unknown fields are ignored and unknown
//! message types decode to [`AgentMessage::Other`] instead of failing.

mod codec;
mod command;
mod message;


pub use codec::{decode_command, decode_line, encode_command, encode_message};
pub use command::{CommandKind, OrchestratorCommand};
pub use message::{AgentMessage, Envelope, Health, MessageKind, PROTOCOL_VERSION};
