//! Initialization helpers for a pipeline root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{RunnerConfig, write_config};
use super::pipeline_file::DEFAULT_PIPELINE;

const RUNNER_GITIGNORE: &str = "runs/\n";

/// All canonical paths for a pipeline root.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub pipeline_path: PathBuf,
    pub runner_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runner_dir = root.join(".ci-runner");
        Self {
            pipeline_path: root.join("ci-runner.toml"),
            config_path: runner_dir.join("config.toml"),
            gitignore_path: runner_dir.join(".gitignore"),
            runner_dir,
            root,
        }
    }

    /// Resolve a configured path against the root unless already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_runner`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing runner-owned files.
    pub force: bool,
}

/// Write the default pipeline and config into `root`.
///
/// Fails if the pipeline file already exists unless `options.force` is set.
pub fn init_runner(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if paths.pipeline_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.pipeline_path.display()
        ));
    }
    if paths.runner_dir.exists() && !paths.runner_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.runner_dir.display()
        ));
    }

    create_dir(&paths.runner_dir)?;
    write_file(&paths.pipeline_path, DEFAULT_PIPELINE)?;
    write_file(&paths.gitignore_path, RUNNER_GITIGNORE)?;
    write_config(&paths.config_path, &RunnerConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
