use crate::context::SupervisorContext;
use crate::managed::ManagedProcess;
use futures_util::future::{join_all, select_all};
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use unitd_core::{ProcessId, ProcessState, UnitdError};
use unitd_unix::describe_exit;

/// Final state of one pool member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberReport {
    pub name: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Outcome of a pool run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub success: bool,
    pub members: Vec<MemberReport>,
}

impl PoolReport {
    /// First recorded failure, for one-line summaries
    pub fn first_failure(&self) -> Option<String> {
        self.members.iter().find_map(|member| {
            member
                .failure
                .as_ref()
                .map(|failure| format!("{}: {}", member.name, failure))
        })
    }
}

/// Processes started in dependency order and shut down together.
///
/// Members are added with [`ProcessPool::start_sync`], each one confirmed
/// before the next is spawned. [`ProcessPool::run`] then waits for the first
/// member exit, the quit signal or cancellation, and stops everything.
pub struct ProcessPool {
    context: SupervisorContext,
    processes: Vec<ManagedProcess>,
    started_ok: bool,
    success: Option<bool>,
    quit_watch: Option<JoinHandle<()>>,
}

impl ProcessPool {
    /// The pool cancels a child of `ctx`'s token, so cancelling `ctx` also
    /// shuts the pool down.
    pub fn new(ctx: &SupervisorContext) -> Self {
        Self {
            context: ctx.child(),
            processes: Vec::new(),
            started_ok: true,
            success: None,
            quit_watch: None,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancellation.clone()
    }

    /// Treat `signal` as a request to shut the whole pool down
    pub fn set_quit_signal(&mut self, signal: Signal) -> Result<(), UnitdError> {
        if let Some(previous) = self.quit_watch.take() {
            previous.abort();
        }

        let mut subscription = self.context.signals.subscribe(signal)?;
        let token = self.context.cancellation.clone();
        self.quit_watch = Some(tokio::spawn(async move {
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(()) => {
                        info!("Received {}, shutting down", signal);
                        token.cancel();
                    }
                    Err(e) => warn!("Quit signal watch ended: {}", e),
                },
                _ = token.cancelled() => {}
            }
        }));
        Ok(())
    }

    /// Start `process` and wait for it to be confirmed.
    ///
    /// Returns false without spawning anything if an earlier member failed or
    /// the pool was already asked to quit. A rejected or failed process still
    /// counts against the pool's success.
    pub async fn start_sync(&mut self, mut process: ManagedProcess) -> bool {
        if !self.started_ok {
            warn!(
                "{}: not started, an earlier process failed",
                process.name()
            );
            return false;
        }
        if self.context.is_cancelled() {
            warn!("{}: not started, shutdown requested", process.name());
            self.started_ok = false;
            return false;
        }

        let started = process.start(&self.context).await;
        self.processes.push(process);
        if !started {
            self.started_ok = false;
        }
        started
    }

    /// Whether every member was confirmed before the pool stopped.
    /// `None` until [`ProcessPool::run`] has seen its first event.
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    /// Wait for the first member exit, quit signal or cancellation, then stop
    /// and reap every member.
    pub async fn run(&mut self) -> PoolReport {
        if self.success.is_some() {
            return self.report();
        }

        if self.started_ok && !self.processes.is_empty() {
            let token = self.context.cancellation.clone();
            let first_exit = {
                let exits = select_all(
                    self.processes
                        .iter_mut()
                        .map(|process| Box::pin(process.wait_for_exit())),
                );
                tokio::select! {
                    (status, index, _) = exits => Some((index, status)),
                    _ = token.cancelled() => None,
                }
            };

            match first_exit {
                Some((index, Ok(status))) => info!(
                    "{} {}, shutting down",
                    self.processes[index].name(),
                    describe_exit(&status)
                ),
                Some((index, Err(e))) => warn!(
                    "Cannot wait for {}: {}, shutting down",
                    self.processes[index].name(),
                    e
                ),
                None => info!("Shutdown requested"),
            }
        }

        self.success = Some(self.started_ok);
        info!(
            "Stopping {} processes (success: {})",
            self.processes.len(),
            self.started_ok
        );

        join_all(self.processes.iter_mut().map(|process| process.stop())).await;

        if let Some(watch) = self.quit_watch.take() {
            watch.abort();
        }

        self.report()
    }

    pub fn report(&self) -> PoolReport {
        PoolReport {
            success: self.success.unwrap_or(false),
            members: self
                .processes
                .iter()
                .map(|process| MemberReport {
                    name: process.name().to_string(),
                    state: process.state(),
                    pid: process.pid(),
                    exit: process.exit_status().map(|status| describe_exit(&status)),
                    failure: process.failure().map(str::to_string),
                })
                .collect(),
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if let Some(watch) = self.quit_watch.take() {
            watch.abort();
        }
    }
}
