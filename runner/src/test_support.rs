//! Test-only helpers: scripted executors and temporary workspaces.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RunnerConfig, write_config};
use crate::io::executor::{ExecOutcome, ExecRequest, Invocation, ProcessExecutor};
use crate::io::init::RunnerPaths;
use crate::io::process::SpawnError;
use crate::io::toolchain::{ProvisionRequest, ToolchainProvisioner};

/// Scripted behaviour for one step.
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit(i32),
    Timeout,
    SpawnFailure,
    /// The executor itself fails (not a step failure).
    RunnerError(String),
}

/// One observed call to [`ScriptedExecutor::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    pub step: String,
    pub invocation: Invocation,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Executor returning scripted outcomes by step name. Unscripted steps exit 0.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: HashMap<String, Scripted>,
    stderr: HashMap<String, String>,
    calls: RefCell<Vec<RecordedExec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit(self, step: &str, code: i32) -> Self {
        self.script_step(step, Scripted::Exit(code))
    }

    pub fn timeout(self, step: &str) -> Self {
        self.script_step(step, Scripted::Timeout)
    }

    pub fn spawn_failure(self, step: &str) -> Self {
        self.script_step(step, Scripted::SpawnFailure)
    }

    pub fn runner_error(self, step: &str, message: &str) -> Self {
        self.script_step(step, Scripted::RunnerError(message.to_string()))
    }

    /// Stderr captured for `step`, whatever its scripted outcome.
    pub fn stderr(mut self, step: &str, text: &str) -> Self {
        self.stderr.insert(step.to_string(), text.to_string());
        self
    }

    fn script_step(mut self, step: &str, scripted: Scripted) -> Self {
        self.script.insert(step.to_string(), scripted);
        self
    }

    pub fn calls(&self) -> Vec<RecordedExec> {
        self.calls.borrow().clone()
    }

    /// Step names in invocation order.
    pub fn invoked_steps(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.step.clone()).collect()
    }

    /// Environment the named step was invoked with.
    pub fn env_of(&self, step: &str) -> Option<BTreeMap<String, String>> {
        self.calls
            .borrow()
            .iter()
            .find(|c| c.step == step)
            .map(|c| c.env.clone())
    }
}

impl ProcessExecutor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutcome> {
        self.calls.borrow_mut().push(RecordedExec {
            step: request.step.clone(),
            invocation: request.invocation.clone(),
            workdir: request.workdir.clone(),
            env: request.env.clone(),
            timeout: request.timeout,
        });
        let stderr = self.stderr.get(&request.step).cloned().unwrap_or_default();
        match self.script.get(&request.step) {
            None => Ok(ExecOutcome {
                stderr,
                ..ExecOutcome::exited(0)
            }),
            Some(Scripted::Exit(code)) => Ok(ExecOutcome {
                stderr,
                ..ExecOutcome::exited(*code)
            }),
            Some(Scripted::Timeout) => Ok(ExecOutcome {
                stderr,
                ..ExecOutcome::timed_out()
            }),
            Some(Scripted::SpawnFailure) => Err(SpawnError {
                program: request.step.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }
            .into()),
            Some(Scripted::RunnerError(message)) => Err(anyhow!("{message}")),
        }
    }
}

/// One observed provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedProvision {
    pub step: String,
    pub channel: String,
    pub components: Vec<String>,
}

/// Provisioner that succeeds unless the channel was marked unavailable.
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    unavailable: HashSet<String>,
    calls: RefCell<Vec<RecordedProvision>>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable(mut self, channel: &str) -> Self {
        self.unavailable.insert(channel.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedProvision> {
        self.calls.borrow().clone()
    }
}

impl ToolchainProvisioner for ScriptedProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ExecOutcome> {
        self.calls.borrow_mut().push(RecordedProvision {
            step: request.step.clone(),
            channel: request.selection.channel.clone(),
            components: request.selection.components.clone(),
        });
        if self.unavailable.contains(&request.selection.channel) {
            return Ok(ExecOutcome::exited(1));
        }
        Ok(ExecOutcome::exited(0))
    }
}

/// A throwaway project root with `.ci-runner/` helpers.
pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> RunnerPaths {
        RunnerPaths::new(self.path())
    }

    /// Write `ci-runner.toml` at the workspace root.
    pub fn write_pipeline(&self, contents: &str) -> Result<PathBuf> {
        let path = self.paths().pipeline_path;
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_config(&self, cfg: &RunnerConfig) -> Result<PathBuf> {
        let path = self.paths().config_path;
        write_config(&path, cfg)?;
        Ok(path)
    }
}

/// Config for library-level tests: no echo, no rustup, logs under the workspace.
pub fn quiet_config() -> RunnerConfig {
    let mut cfg = RunnerConfig::default();
    cfg.stream_output = false;
    cfg.toolchain.install = false;
    cfg
}
