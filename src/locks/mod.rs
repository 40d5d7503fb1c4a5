//! Singleton instance lock.
//!
//! Only one orchestrator may run per state directory. The lock file
//! `<state_dir>/drover.lock` is created with **create_new** semantics
//! (exclusive create) and holds JSON metadata:
//! - `owner`: the owner of the lock (e.g., `user@HOST`)
//! - `pid`: the process ID of the holder
//! - `created_at`: RFC3339 timestamp
//! - `action`: what the holder is doing (e.g., `run`)
//!
//! A lock whose pid no longer refers to a live process is stale and is
//! reclaimed on the next acquisition. The lock is released by an RAII guard.

mod guard;
mod metadata;
mod operations;


// Re-export public API
pub use guard::LockGuard;
pub use metadata::{LockMetadata, pid_is_alive};
pub use operations::{acquire_instance_lock, read_instance_lock};
