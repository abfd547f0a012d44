use crate::context::SupervisorContext;
use crate::hooks::{LaunchPlan, run_commands};
use crate::output::OutputRelay;
use crate::readiness::ArmedReadiness;
use nix::sys::signal::Signal;
use std::process::ExitStatus;
use tracing::{debug, error, info, warn};
use unitd_core::{
    ProcessHandle, ProcessId, ProcessSpec, ProcessState, ReadinessDetector, TerminationResult,
    UnitdError,
};
use unitd_unix::{describe_exit, spawn};

/// One supervised OS process and the lifecycle around it.
///
/// States only move forward, see [`ProcessState`]. `start` and `stop` never
/// return errors: failures land the process in [`ProcessState::Failed`] with
/// the reason kept in [`ManagedProcess::failure`].
pub struct ManagedProcess {
    spec: ProcessSpec,
    readiness: ReadinessDetector,
    state: ProcessState,
    plan: LaunchPlan,
    handle: Option<Box<dyn ProcessHandle>>,
    output: Option<OutputRelay>,
    pid: Option<ProcessId>,
    exit_status: Option<ExitStatus>,
    failure: Option<String>,
}

impl ManagedProcess {
    pub fn new(spec: ProcessSpec, readiness: ReadinessDetector) -> Self {
        Self {
            spec,
            readiness,
            state: ProcessState::NotStarted,
            plan: LaunchPlan::default(),
            handle: None,
            output: None,
            pid: None,
            exit_status: None,
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Pid recorded at spawn; kept after the process is reaped
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn tag(&self) -> String {
        match self.pid {
            Some(pid) => format!("{}[{}]", self.spec.tag(), pid),
            None => self.spec.tag().to_string(),
        }
    }

    fn advance(&mut self, next: ProcessState) -> Result<(), UnitdError> {
        if !self.state.can_advance_to(next) {
            return Err(UnitdError::InvalidState(format!(
                "{}: cannot go from {} to {}",
                self.spec.tag(),
                self.state,
                next
            )));
        }
        debug!("{}: {} -> {}", self.tag(), self.state, next);
        self.state = next;
        Ok(())
    }

    /// Start the process and wait until it is confirmed running.
    ///
    /// Returns true if the process reached `Running`. Cancelling `ctx` while
    /// confirming aborts the start.
    pub async fn start(&mut self, ctx: &SupervisorContext) -> bool {
        if self.state != ProcessState::NotStarted {
            warn!("{}: start called while {}", self.tag(), self.state);
            return false;
        }

        match self.try_start(ctx).await {
            Ok(()) => {
                info!("{}: running", self.tag());
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    async fn try_start(&mut self, ctx: &SupervisorContext) -> Result<(), UnitdError> {
        self.advance(ProcessState::Starting)?;
        info!("{}: starting {}", self.tag(), self.spec.command);

        self.plan = LaunchPlan::resolve(&self.spec)?;
        let tag = self.tag();

        if !run_commands(&self.spec.exec_start_pre, &self.plan, &tag, "pre-start").await? {
            return Err(UnitdError::CommandFailed(format!(
                "{tag}: pre-start command failed"
            )));
        }

        let mut armed = ArmedReadiness::arm(&self.readiness, &ctx.signals)?;

        let mut request = self.plan.request(&self.spec.command, &self.spec.args);
        request.ignore_signal = self.readiness.ignored_in_child();
        let mut handle = spawn(&request)?;
        self.pid = handle.pid();
        self.output = Some(OutputRelay::attach(&mut handle, &self.tag()));
        self.handle = Some(Box::new(handle));

        self.advance(ProcessState::Confirming)?;
        self.confirm(&mut armed, ctx).await?;
        drop(armed);

        let tag = self.tag();
        if !run_commands(&self.spec.exec_start_post, &self.plan, &tag, "post-start").await? {
            warn!("{}: post-start command failed, continuing", tag);
        }

        self.advance(ProcessState::Running)
    }

    async fn confirm(
        &mut self,
        armed: &mut ArmedReadiness,
        ctx: &SupervisorContext,
    ) -> Result<(), UnitdError> {
        let tag = self.tag();
        debug!("{}: waiting for {}", tag, self.readiness);

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| UnitdError::InvalidState(format!("{tag}: no process to confirm")))?;

        let confirmation = async {
            tokio::select! {
                ready = armed.wait() => ready,
                status = handle.wait() => match status {
                    Ok(status) => Err(UnitdError::ExitedDuringStartup(format!(
                        "{tag} {}",
                        describe_exit(&status)
                    ))),
                    Err(e) => Err(UnitdError::Io(e)),
                },
                _ = ctx.cancellation.cancelled() => Err(UnitdError::Cancelled),
            }
        };

        match self.spec.start_timeout {
            Some(limit) => tokio::time::timeout(limit, confirmation)
                .await
                .map_err(|_| {
                    UnitdError::Timeout(format!("{tag} was not confirmed within {limit:?}"))
                })?,
            None => confirmation.await,
        }
    }

    // Kill whatever was spawned, reap it, and record why the start failed.
    async fn fail(&mut self, reason: UnitdError) {
        let tag = self.tag();
        error!("{}: {}", tag, reason);
        self.failure = Some(reason.to_string());

        if let Some(handle) = self.handle.as_mut() {
            handle.signal(Signal::SIGKILL);
            match handle.wait().await {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => warn!("{}: cannot reap: {}", tag, e),
            }
        }
        if let Some(output) = self.output.take() {
            output.abort();
        }

        if let Err(e) = self.advance(ProcessState::Failed) {
            warn!("{}", e);
        }
    }

    /// Stop the process and run its stop hooks.
    ///
    /// A no-op for processes that never started or already finished. For a
    /// process caught mid-start (cancelled by the pool) this does nothing
    /// either, since `start` reaps it before returning.
    pub async fn stop(&mut self) {
        match self.state {
            ProcessState::Running => {}
            ProcessState::NotStarted | ProcessState::Stopped | ProcessState::Failed => {
                debug!("{}: stop ignored while {}", self.tag(), self.state);
                return;
            }
            other => {
                warn!("{}: stop ignored while {}", self.tag(), other);
                return;
            }
        }

        if let Err(e) = self.advance(ProcessState::Stopping) {
            warn!("{}", e);
            return;
        }
        info!("{}: stopping", self.tag());

        let tag = self.tag();
        let mut clean = true;

        match run_commands(&self.spec.exec_stop, &self.plan, &tag, "stop").await {
            Ok(true) => {}
            Ok(false) => debug!("{}: stop command failed, continuing", tag),
            Err(e) => {
                error!("{}: {}", tag, e);
                self.failure.get_or_insert_with(|| e.to_string());
                clean = false;
            }
        }

        if !self.terminate().await {
            clean = false;
        }

        if let Some(output) = self.output.take() {
            output.abort();
        }

        match run_commands(&self.spec.exec_stop_post, &self.plan, &tag, "post-stop").await {
            Ok(true) => {}
            Ok(false) => debug!("{}: post-stop command failed", tag),
            Err(e) => {
                error!("{}: {}", tag, e);
                self.failure.get_or_insert_with(|| e.to_string());
                clean = false;
            }
        }

        let next = if clean {
            ProcessState::Stopped
        } else {
            ProcessState::Failed
        };
        if let Err(e) = self.advance(next) {
            warn!("{}", e);
        }
        info!("{}: {}", tag, self.state);
    }

    // Returns false when the process outlived its stop timeout.
    async fn terminate(&mut self) -> bool {
        let tag = self.tag();
        let stop_signal = self.spec.stop_signal;
        let stop_timeout = self.spec.stop_timeout;
        let send_sigkill = self.spec.send_sigkill;

        let Some(handle) = self.handle.as_mut() else {
            return true;
        };

        match handle.try_wait() {
            Ok(Some(status)) => {
                debug!("{}: already {}", tag, describe_exit(&status));
                self.exit_status = Some(status);
                return true;
            }
            Ok(None) => {}
            Err(e) => warn!("{}: cannot poll: {}", tag, e),
        }

        match handle.signal(stop_signal) {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!("{}: sending {} gave {:?}", tag, stop_signal, other),
        }

        let mut in_time = true;
        let status = match tokio::time::timeout(stop_timeout, handle.wait()).await {
            Ok(status) => status,
            Err(_) => {
                in_time = false;
                if send_sigkill {
                    warn!("{}: did not stop within {:?}, killing", tag, stop_timeout);
                    handle.signal(Signal::SIGKILL);
                } else {
                    warn!(
                        "{}: did not stop within {:?}, waiting for it to exit",
                        tag, stop_timeout
                    );
                }
                handle.wait().await
            }
        };

        match status {
            Ok(status) => {
                debug!("{}: {}", tag, describe_exit(&status));
                self.exit_status = Some(status);
            }
            Err(e) => {
                error!("{}: cannot reap: {}", tag, e);
                in_time = false;
            }
        }

        if !in_time {
            self.failure
                .get_or_insert_with(|| format!("{tag} did not stop within {stop_timeout:?}"));
        }
        in_time
    }

    /// Wait for the process to exit on its own.
    ///
    /// Never resolves for a process that was not spawned. Once the process is
    /// reaped the cached status is returned immediately.
    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus, UnitdError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };
        let status = handle.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use unitd_core::{CommandLine, HostPort};

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::builder()
            .name(name)
            .command("sh")
            .args(["-c", script])
            .stop_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_immediate_start_and_stop() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(sh("sleeper", "sleep 30"), ReadinessDetector::Immediate);

        assert!(process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid().is_some());

        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(
            process.exit_status().map(|s| describe_exit(&s)),
            Some("killed by SIGTERM".to_string())
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(sh("short", "sleep 30"), ReadinessDetector::Immediate);
        process.stop().await;
        assert_eq!(process.state(), ProcessState::NotStarted);

        assert!(process.start(&ctx).await);
        process.stop().await;
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_wait_confirms() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(
            sh("announcer", "kill -USR2 $PPID; sleep 30"),
            ReadinessDetector::signal(Signal::SIGUSR2),
        );
        assert!(process.start(&ctx).await);
        assert!(!ctx.signals.is_watched(Signal::SIGUSR2));
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_never_delivered_times_out() {
        let ctx = SupervisorContext::new();
        let mut spec = sh("silent", "sleep 30");
        spec.start_timeout = Some(Duration::from_millis(300));
        let mut process = ManagedProcess::new(spec, ReadinessDetector::signal(Signal::SIGWINCH));

        assert!(!process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(process.failure().unwrap().contains("not confirmed"));
        assert!(!ctx.signals.is_watched(Signal::SIGWINCH));
        // Killed and reaped rather than left running.
        assert_eq!(
            process.exit_status().map(|s| describe_exit(&s)),
            Some("killed by SIGKILL".to_string())
        );

        process.stop().await;
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(
            sh("crasher", "exit 4"),
            ReadinessDetector::port(HostPort::new("127.0.0.1", 1)),
        );
        assert!(!process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(process.failure().unwrap().contains("exited with code 4"));
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let ctx = SupervisorContext::new();
        let spec = ProcessSpec::builder()
            .name("ghost")
            .command("/nonexistent/unitd-server")
            .build()
            .unwrap();
        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(!process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(process.pid().is_none());
    }

    #[tokio::test]
    async fn test_pre_start_failure_prevents_spawn() {
        let ctx = SupervisorContext::new();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let spec = ProcessSpec::builder()
            .name("gated")
            .command("touch")
            .args([marker.to_str().unwrap()])
            .exec_start_pre(["false".parse().unwrap()])
            .build()
            .unwrap();
        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(!process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_post_start_failure_is_best_effort() {
        let ctx = SupervisorContext::new();
        let mut spec = sh("tolerant", "sleep 30");
        spec.exec_start_post = vec!["false".parse().unwrap()];
        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Running);
        process.stop().await;
    }

    #[tokio::test]
    async fn test_stop_hooks_run_around_signal() {
        let ctx = SupervisorContext::new();
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("hooks.log");
        let log_path = log.to_str().unwrap();
        let mut spec = sh("hooked", "sleep 30");
        spec.exec_stop = vec![CommandLine::from_words([
            "sh",
            "-c",
            &format!("echo stop >> {log_path}"),
        ])];
        spec.exec_stop_post = vec![CommandLine::from_words([
            "sh",
            "-c",
            &format!("echo post-stop >> {log_path}"),
        ])];

        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(process.start(&ctx).await);
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written, "stop\npost-stop\n");
    }

    #[tokio::test]
    async fn test_stop_timeout_escalates_to_kill() {
        let ctx = SupervisorContext::new();
        let mut spec = sh("stubborn", "trap '' TERM; while :; do sleep 1; done");
        spec.stop_timeout = Duration::from_millis(300);
        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(process.start(&ctx).await);
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.stop().await;
        assert_eq!(process.state(), ProcessState::Failed);
        assert_eq!(
            process.exit_status().map(|s| describe_exit(&s)),
            Some("killed by SIGKILL".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancelled_while_confirming() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(
            sh("waiting", "sleep 30"),
            ReadinessDetector::signal(Signal::SIGURG),
        );
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        assert!(!process.start(&ctx).await);
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(!ctx.signals.is_watched(Signal::SIGURG));
    }

    #[tokio::test]
    async fn test_wait_for_exit_after_natural_exit() {
        let ctx = SupervisorContext::new();
        let mut process = ManagedProcess::new(sh("brief", "sleep 0.2; exit 0"), ReadinessDetector::Immediate);
        assert!(process.start(&ctx).await);
        let status = tokio::time::timeout(Duration::from_secs(5), process.wait_for_exit())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());

        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_process_alive() {
        let ctx = SupervisorContext::new();
        let mut spec = sh(
            "latin1",
            "printf 'caf\\351\\n'; sleep 0.5; echo still-alive; sleep 30",
        );
        spec.exec_start_pre = vec![CommandLine::from_words([
            "sh",
            "-c",
            "printf 'pr\\351-start\\n'; sleep 0.2; echo done",
        ])];
        let mut process = ManagedProcess::new(spec, ReadinessDetector::Immediate);
        assert!(process.start(&ctx).await);

        let waited = tokio::time::timeout(Duration::from_secs(2), process.wait_for_exit()).await;
        assert!(waited.is_err(), "process exited early: {waited:?}");
        assert_eq!(process.state(), ProcessState::Running);

        process.stop().await;
        assert_eq!(
            process.exit_status().map(|s| describe_exit(&s)),
            Some("killed by SIGTERM".to_string())
        );
    }
}
