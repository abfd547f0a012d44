use crate::output::OutputRelay;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use unitd_core::{CommandLine, ProcessHandle, ProcessSpec, UnitdError};
use unitd_unix::{ResolvedIdentity, SpawnRequest, describe_exit, resolve_identity, spawn};

// How long a finished hook's output may keep draining, in case it left
// background children holding the pipes open.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Identity, directory and environment shared by a process and its hooks
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub identity: ResolvedIdentity,
}

impl LaunchPlan {
    /// Resolve user and group references. Environment indirections are read now.
    pub fn resolve(spec: &ProcessSpec) -> Result<Self, UnitdError> {
        Ok(Self {
            working_dir: spec.working_directory.clone(),
            env: spec.env.clone(),
            identity: resolve_identity(spec.user.as_ref(), spec.group.as_ref())?,
        })
    }

    pub fn request(&self, program: &str, args: &[String]) -> SpawnRequest {
        SpawnRequest {
            program: program.to_string(),
            args: args.to_vec(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            uid: self.identity.uid,
            gid: self.identity.gid,
            ignore_signal: None,
            own_process_group: true,
            capture_output: true,
        }
    }
}

/// Run `commands` in order and wait for each.
///
/// Returns `Ok(false)` at the first command that exits unsuccessfully, unless
/// it was marked to have its failure ignored. A command that cannot be spawned
/// at all is an error.
pub async fn run_commands(
    commands: &[CommandLine],
    plan: &LaunchPlan,
    tag: &str,
    phase: &str,
) -> Result<bool, UnitdError> {
    for command in commands.iter().filter(|c| !c.is_empty()) {
        debug!("{}:{}: running {}", tag, phase, command);

        let mut handle = spawn(&plan.request(command.program(), command.args()))?;
        let relay = OutputRelay::attach(&mut handle, tag);
        let status = handle.wait().await?;
        let _ = tokio::time::timeout(OUTPUT_DRAIN, relay.finish()).await;

        if status.success() {
            debug!("{}:{}: {} succeeded", tag, phase, command.program());
            continue;
        }

        if command.ignore_failure() {
            debug!(
                "{}:{}: {} {}, ignored",
                tag,
                phase,
                command.program(),
                describe_exit(&status)
            );
            continue;
        }

        warn!(
            "{}:{}: {} {}",
            tag,
            phase,
            command.program(),
            describe_exit(&status)
        );
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> LaunchPlan {
        LaunchPlan::default()
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let commands: Vec<CommandLine> = vec![
            "true".parse().unwrap(),
            "sh -c 'exit 0'".parse().unwrap(),
        ];
        assert!(run_commands(&commands, &plan(), "test", "pre").await.unwrap());
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let commands: Vec<CommandLine> = vec![
            "false".parse().unwrap(),
            CommandLine::from_words(["touch", marker.to_str().unwrap()]),
        ];
        assert!(!run_commands(&commands, &plan(), "test", "pre").await.unwrap());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_ignored_failure_continues() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let commands: Vec<CommandLine> = vec![
            "-false".parse().unwrap(),
            CommandLine::from_words(["touch", marker.to_str().unwrap()]),
        ];
        assert!(run_commands(&commands, &plan(), "test", "pre").await.unwrap());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_unspawnable_command_is_error() {
        let commands: Vec<CommandLine> = vec!["/nonexistent/unitd-hook".parse().unwrap()];
        let error = run_commands(&commands, &plan(), "test", "post").await.unwrap_err();
        assert!(matches!(error, UnitdError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_hooks_share_directory_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LaunchPlan {
            working_dir: Some(dir.path().to_path_buf()),
            env: BTreeMap::from([("UNITD_HOOK_VALUE".to_string(), "shared".to_string())]),
            ..Default::default()
        };
        let commands: Vec<CommandLine> =
            vec!["sh -c 'printf %s \"$UNITD_HOOK_VALUE\" > hook.out'".parse().unwrap()];
        assert!(run_commands(&commands, &plan, "test", "pre").await.unwrap());
        let written = std::fs::read_to_string(dir.path().join("hook.out")).unwrap();
        assert_eq!(written, "shared");
    }
}
