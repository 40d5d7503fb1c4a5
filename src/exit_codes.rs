//! Exit code constants for the drover CLI.
//!
//! - 0: Success
//! - 1: User error (bad args, invalid configuration)
//! - 2: Runtime failure
//! - 3: Control-plane client failure
//! - 4: Another orchestrator instance is already running

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// User error: bad arguments or invalid configuration.
pub const USER_ERROR: i32 = 1;

/// The orchestrator failed while running.
pub const RUNTIME_FAILURE: i32 = 2;

/// A `drover ctl` request could not be delivered or was rejected.
pub const CONTROL_FAILURE: i32 = 3;

/// The singleton lock is held by a live orchestrator.
pub const ALREADY_RUNNING: i32 = 4;
