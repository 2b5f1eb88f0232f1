//! Run logging helpers for `.ci-runner/runs/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::run::Run;

/// Canonical files for one run.
#[derive(Debug, Clone)]
pub struct RunLogPaths {
    pub dir: PathBuf,
    pub run_path: PathBuf,
    pub summary_path: PathBuf,
}

impl RunLogPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            run_path: dir.join("run.json"),
            summary_path: dir.join("summary.md"),
            dir,
        }
    }

    /// `01-fmt-check.log`, numbered from one in declaration order.
    pub fn step_log_path(&self, index: usize, name: &str) -> PathBuf {
        self.dir.join(format!("{:02}-{}.log", index + 1, slug(name)))
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create run log dir {}", self.dir.display()))
    }
}

pub fn write_run(paths: &RunLogPaths, run: &Run) -> Result<()> {
    debug!(path = %paths.run_path.display(), status = %run.status(), "writing run record");
    write_json(&paths.run_path, run)
}

pub fn write_summary(paths: &RunLogPaths, summary: &str) -> Result<()> {
    write_text(&paths.summary_path, summary)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

/// File-name-safe form of a step name.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "step".to_string()
    } else {
        trimmed.to_string()
    }
}
