//! Loading and validation of a pipeline root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::warn;

use crate::core::pipeline::Pipeline;
use crate::io::config::{RunnerConfig, load_config};
use crate::io::init::RunnerPaths;
use crate::io::pipeline_file::load_pipeline;

/// Explicit file locations; `None` means the canonical path under the root.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub pipeline: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// A validated pipeline and the config it will run under.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub paths: RunnerPaths,
    pub pipeline_path: PathBuf,
    pub pipeline: Pipeline,
    pub config: RunnerConfig,
}

/// Load the pipeline and config for `root`, failing on the first invalid file.
///
/// A missing config file means defaults; a missing pipeline file is an error.
pub fn load_root(root: &Path, options: &LoadOptions) -> Result<Loaded> {
    let paths = RunnerPaths::new(root);
    let pipeline_path = options
        .pipeline
        .as_deref()
        .map_or_else(|| paths.pipeline_path.clone(), |path| paths.resolve(path));
    let config_path = options
        .config
        .as_deref()
        .map_or_else(|| paths.config_path.clone(), |path| paths.resolve(path));

    ensure_file(&pipeline_path)?;
    let config = load_config(&config_path).with_context(|| "load config.toml")?;
    let pipeline = load_pipeline(&pipeline_path)?;
    check_gitignore(&paths, &config);

    Ok(Loaded {
        paths,
        pipeline_path,
        pipeline,
        config,
    })
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!(
            "missing pipeline file {} (run `ci-runner init` to create one)",
            path.display()
        ));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

/// Run logs under the root should not end up in commits.
fn check_gitignore(paths: &RunnerPaths, config: &RunnerConfig) {
    if !config.run_log.enabled || !paths.gitignore_path.is_file() {
        return;
    }
    let Ok(contents) = std::fs::read_to_string(&paths.gitignore_path) else {
        return;
    };
    if !contents.lines().any(|line| line.trim() == "runs/") {
        warn!(path = %paths.gitignore_path.display(), "missing 'runs/' entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::{InitOptions, init_runner};
    use crate::test_support::TestWorkspace;

    #[test]
    fn loads_initialized_root() {
        let workspace = TestWorkspace::new().expect("workspace");
        init_runner(workspace.path(), &InitOptions { force: false }).expect("init");

        let loaded = load_root(workspace.path(), &LoadOptions::default()).expect("load");
        assert_eq!(loaded.pipeline.name(), "rust");
        assert_eq!(loaded.config, RunnerConfig::default());
        assert_eq!(loaded.pipeline_path, workspace.paths().pipeline_path);
    }

    #[test]
    fn missing_pipeline_points_at_init() {
        let workspace = TestWorkspace::new().expect("workspace");
        let err = load_root(workspace.path(), &LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("ci-runner init"));
    }

    #[test]
    fn explicit_paths_resolve_against_root() {
        let workspace = TestWorkspace::new().expect("workspace");
        std::fs::write(
            workspace.path().join("other.toml"),
            "[pipeline]\nname = \"other\"\n\n[[steps]]\nname = \"a\"\nrun = \"true\"\n",
        )
        .expect("write");

        let loaded = load_root(
            workspace.path(),
            &LoadOptions {
                pipeline: Some(PathBuf::from("other.toml")),
                config: Some(PathBuf::from("missing-config.toml")),
            },
        )
        .expect("load");
        assert_eq!(loaded.pipeline.name(), "other");
        assert_eq!(loaded.config, RunnerConfig::default());
    }

    #[test]
    fn invalid_config_is_reported() {
        let workspace = TestWorkspace::new().expect("workspace");
        workspace
            .write_pipeline("[pipeline]\nname = \"x\"\n\n[[steps]]\nname = \"a\"\nrun = \"true\"\n")
            .expect("pipeline");
        std::fs::create_dir_all(&workspace.paths().runner_dir).expect("dir");
        std::fs::write(&workspace.paths().config_path, "output_limit_bytes = 0\n").expect("write");

        let err = load_root(workspace.path(), &LoadOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("output_limit_bytes must be > 0"));
    }
}
