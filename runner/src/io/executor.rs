//! Process executor abstraction for step commands.
//!
//! The [`ProcessExecutor`] trait decouples the pipeline runner from actually
//! spawning processes. Tests use scripted executors that return predetermined
//! exit codes and record every invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, StreamOptions, run_command};

/// How a step's command is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Script passed as the last argument of the configured shell.
    Shell(String),
    /// Program plus arguments, no shell.
    Argv(Vec<String>),
}

/// Parameters for one process invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Step name, for logs.
    pub step: String,
    pub invocation: Invocation,
    /// Working directory for the child.
    pub workdir: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Kill the child after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Keep at most this many bytes of each stream in memory.
    pub output_limit_bytes: usize,
    pub stream: StreamOptions,
}

/// Observed result of a process that was started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// `None` when killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Bounded tail of stderr, used in failure reports.
    pub stderr: String,
}

impl ExecOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    fn from_output(output: &CommandOutput) -> Self {
        Self {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            stderr: output.stderr_tail.clone(),
        }
    }
}

/// Abstraction over spawning step commands.
///
/// `Err` means the runner could not observe an outcome. A spawn failure is
/// reported as a [`crate::io::process::SpawnError`] inside the error so callers
/// can tell it apart from runner faults.
pub trait ProcessExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutcome>;
}

/// Executor that spawns real processes on this machine.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    /// Shell program and flags; the script is appended as the last argument.
    shell: Vec<String>,
}

impl SystemExecutor {
    pub fn new(shell: Vec<String>) -> Result<Self> {
        if shell.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("shell must be a non-empty array"));
        }
        Ok(Self { shell })
    }

    fn command(&self, invocation: &Invocation) -> Result<Command> {
        let (program, args): (&String, Vec<&String>) = match invocation {
            Invocation::Shell(script) => {
                let (program, flags) = self
                    .shell
                    .split_first()
                    .ok_or_else(|| anyhow!("shell must be a non-empty array"))?;
                let mut args: Vec<&String> = flags.iter().collect();
                args.push(script);
                (program, args)
            }
            Invocation::Argv(argv) => {
                let (program, rest) = argv
                    .split_first()
                    .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
                (program, rest.iter().collect())
            }
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl ProcessExecutor for SystemExecutor {
    #[instrument(skip_all, fields(step = %request.step, timeout_secs = request.timeout.map(|t| t.as_secs())))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutcome> {
        info!(workdir = %request.workdir.display(), "starting step process");
        let mut cmd = self.command(&request.invocation)?;
        cmd.current_dir(&request.workdir).envs(&request.env);

        let output = run_command(
            cmd,
            request.timeout,
            request.output_limit_bytes,
            &request.stream,
        )
        .with_context(|| format!("run step '{}'", request.step))?;

        let outcome = ExecOutcome::from_output(&output);
        if outcome.timed_out {
            warn!(step = %request.step, "step timed out");
        } else if !outcome.success() {
            warn!(step = %request.step, exit_code = ?outcome.exit_code, "step failed");
        } else {
            debug!(step = %request.step, "step completed successfully");
        }
        Ok(outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::process::SpawnError;

    fn request(temp: &tempfile::TempDir, invocation: Invocation) -> ExecRequest {
        ExecRequest {
            step: "step".to_string(),
            invocation,
            workdir: temp.path().to_path_buf(),
            env: BTreeMap::new(),
            timeout: Some(Duration::from_secs(10)),
            output_limit_bytes: 1000,
            stream: StreamOptions::default(),
        }
    }

    fn executor() -> SystemExecutor {
        SystemExecutor::new(vec!["sh".to_string(), "-c".to_string()]).expect("executor")
    }

    #[test]
    fn shell_invocation_sees_env_and_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(
            &temp,
            Invocation::Shell("echo \"$GREETING\" > out.txt".to_string()),
        );
        req.env.insert("GREETING".to_string(), "hi".to_string());

        let outcome = executor().exec(&req).expect("exec");
        assert!(outcome.success());
        let written = std::fs::read_to_string(temp.path().join("out.txt")).expect("read");
        assert_eq!(written.trim(), "hi");
    }

    #[test]
    fn argv_invocation_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(
            &temp,
            Invocation::Argv(vec!["sh".into(), "-c".into(), "echo bad >&2; exit 2".into()]),
        );
        let outcome = executor().exec(&req).expect("exec");
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.stderr, "bad\n");
    }

    #[test]
    fn stderr_keeps_last_lines_past_output_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(
            &temp,
            Invocation::Shell("for i in $(seq 1 50); do echo line$i >&2; done; exit 1".to_string()),
        );
        req.output_limit_bytes = 64;

        let outcome = executor().exec(&req).expect("exec");
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.stderr.ends_with("line50\n"));
        assert!(!outcome.stderr.contains("line1\n"));
    }

    #[test]
    fn shell_timeout_is_bounded_when_script_forks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(&temp, Invocation::Shell("sleep 8; echo done".to_string()));
        req.timeout = Some(Duration::from_secs(1));

        let started = std::time::Instant::now();
        let outcome = executor().exec(&req).expect("exec");
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn spawn_failure_is_downcastable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(
            &temp,
            Invocation::Argv(vec!["no-such-program-for-ci-runner".into()]),
        );
        let err = executor().exec(&req).unwrap_err();
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }

    #[test]
    fn empty_shell_is_rejected() {
        assert!(SystemExecutor::new(Vec::new()).is_err());
        assert!(SystemExecutor::new(vec![" ".to_string()]).is_err());
    }
}
