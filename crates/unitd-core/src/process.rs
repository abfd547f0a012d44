use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Lifecycle of a managed process.
///
/// States only ever move forward:
/// `NotStarted → Starting → Confirming → Running → Stopping → {Stopped | Failed}`.
/// `Failed` can also be entered directly from `Starting` or `Confirming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Confirming,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    fn rank(self) -> u8 {
        match self {
            ProcessState::NotStarted => 0,
            ProcessState::Starting => 1,
            ProcessState::Confirming => 2,
            ProcessState::Running => 3,
            ProcessState::Stopping => 4,
            ProcessState::Stopped | ProcessState::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only order
    pub fn can_advance_to(self, next: ProcessState) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (ProcessState::NotStarted, ProcessState::Failed) => false,
            (from, ProcessState::Stopped) => from == ProcessState::Stopping,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotStarted => "not-started",
            ProcessState::Starting => "starting",
            ProcessState::Confirming => "confirming",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of delivering a signal to a process
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Handle to a spawned OS process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has been reaped)
    fn pid(&self) -> Option<ProcessId>;

    /// Get the program that started this process
    fn command(&self) -> &str;

    /// Deliver `signal` to the process
    fn signal(&self, signal: Signal) -> TerminationResult;

    /// Try to get exit status without blocking
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;

    /// Wait for the process to exit and reap it
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
}
