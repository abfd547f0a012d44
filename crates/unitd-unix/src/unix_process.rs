use async_trait::async_trait;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};
use unitd_core::{ProcessHandle, ProcessId, TerminationResult, UnitdError};

/// Everything needed to exec one program with a resolved identity
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Signal set to `SIG_IGN` in the child before exec
    pub ignore_signal: Option<Signal>,
    /// Put the child in a process group of its own
    pub own_process_group: bool,
    /// Pipe stdout/stderr back to the supervisor instead of inheriting them
    pub capture_output: bool,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
            ..Default::default()
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Unix process handle backed by a tokio child
pub struct UnixProcessHandle {
    child: Child,
    command: String,
}

impl UnixProcessHandle {
    pub fn new(child: Child, command: String) -> Self {
        Self { child, command }
    }

    /// Take the piped output streams, if output was captured
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn pid(&self) -> Option<ProcessId> {
        self.child.id()
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn signal(&self, signal: Signal) -> TerminationResult {
        match self.pid() {
            Some(pid) => send_signal(pid, signal),
            None => TerminationResult::ProcessNotFound,
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// Spawn a process as described by `request`
pub fn spawn(request: &SpawnRequest) -> Result<UnixProcessHandle, UnitdError> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args).stdin(Stdio::null());

    if request.capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    if let Some(dir) = &request.working_dir {
        cmd.current_dir(dir);
    }

    cmd.envs(&request.env);

    if let Some(gid) = request.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = request.uid {
        cmd.uid(uid);
    }

    if request.own_process_group {
        cmd.process_group(0);
    }

    if let Some(ignored) = request.ignore_signal {
        // SAFETY: the hook only calls sigaction(2), which is async-signal-safe
        // and does not allocate, between fork and exec.
        unsafe {
            cmd.pre_exec(move || ignore_signal(ignored));
        }
    }

    // A handle dropped without being reaped must not leave the child behind.
    cmd.kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| UnitdError::spawn_failed(request.program.clone(), e))?;

    if let Some(pid) = child.id() {
        debug!("Spawned Unix process: {} (PID: {})", request.display(), pid);
    }

    Ok(UnixProcessHandle::new(child, request.program.clone()))
}

fn ignore_signal(signal: Signal) -> std::io::Result<()> {
    // SAFETY: installing SIG_IGN does not run any handler code.
    unsafe { signal::signal(signal, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(std::io::Error::from)
}

/// Deliver `signal` to `pid`
pub fn send_signal(pid: ProcessId, sig: Signal) -> TerminationResult {
    let nix_pid = NixPid::from_raw(pid as i32);

    match signal::kill(nix_pid, sig) {
        Ok(()) => {
            info!("Sent {} to process {}", sig, pid);
            TerminationResult::Success
        }
        Err(nix::errno::Errno::ESRCH) => {
            info!("Process {} not found (already terminated)", pid);
            TerminationResult::ProcessNotFound
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("Permission denied to signal process {}", pid);
            TerminationResult::AccessDenied
        }
        Err(e) => {
            warn!("Failed to send {} to process {}: {}", sig, pid, e);
            TerminationResult::Failed(format!("{sig} failed: {e}"))
        }
    }
}

/// Human readable form of an exit status
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    match status.signal() {
        Some(raw) => match Signal::try_from(raw) {
            Ok(sig) => format!("killed by {sig}"),
            Err(_) => format!("killed by signal {raw}"),
        },
        None => "exited".to_string(),
    }
}
