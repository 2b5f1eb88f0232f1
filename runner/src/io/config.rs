//! Runner configuration stored under `.ci-runner/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Runner configuration (TOML).
///
/// Describes how the host runs steps, not which steps run; the step list
/// lives in the pipeline file. Missing fields default to values matching a
/// hosted CI runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Per-step wall-clock limit in seconds unless the step sets its own.
    pub step_timeout_secs: u64,

    /// Keep at most this many bytes of each step stream in memory.
    pub output_limit_bytes: usize,

    /// Forward step output to the terminal while it runs.
    pub stream_output: bool,

    /// Shell used for `run = "..."` steps; the script is appended last.
    pub shell: Vec<String>,

    pub run_log: RunLogConfig,

    pub toolchain: ToolchainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunLogConfig {
    /// Write `run.json`, step logs and `summary.md` for every run.
    pub enabled: bool,
    /// Directory for run logs, relative to the pipeline root.
    pub dir: PathBuf,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".ci-runner/runs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Install selected channels; when false they are assumed present.
    pub install: bool,
    /// Provisioner program (e.g. `rustup`).
    pub program: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            install: true,
            program: "rustup".to_string(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 6 * 60 * 60,
            output_limit_bytes: 1_000_000,
            stream_output: true,
            shell: vec![
                "bash".to_string(),
                "--noprofile".to_string(),
                "--norc".to_string(),
                "-eo".to_string(),
                "pipefail".to_string(),
                "-c".to_string(),
            ],
            run_log: RunLogConfig::default(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.shell.is_empty() || self.shell[0].trim().is_empty() {
            return Err(anyhow!("shell must be a non-empty array"));
        }
        if self.run_log.enabled && self.run_log.dir.as_os_str().is_empty() {
            return Err(anyhow!("run_log.dir must be non-empty when run_log is enabled"));
        }
        if self.toolchain.install && self.toolchain.program.trim().is_empty() {
            return Err(anyhow!("toolchain.program must be non-empty when install = true"));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
