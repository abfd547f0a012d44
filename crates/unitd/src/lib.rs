//! Process supervision engine.
//!
//! A [`ProcessPool`] starts [`ManagedProcess`]es one at a time, each confirmed
//! by its readiness detector before the next is spawned, then shuts all of
//! them down as soon as one exits or a quit is requested.

pub mod context;
pub mod hooks;
pub mod managed;
pub mod output;
pub mod pool;
pub mod readiness;
pub mod runner;

pub use context::SupervisorContext;
pub use managed::ManagedProcess;
pub use pool::{MemberReport, PoolReport, ProcessPool};
pub use readiness::{ArmedReadiness, poll_port};
pub use runner::supervise;

// Re-export core functionality
pub use unitd_core::*;
