//! Shared deterministic types for the pipeline runner.
//!
//! These types define stable contracts between core components and the run
//! records written to disk. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Event that caused a run to be created.
///
/// Every trigger executes the same step list; the trigger is only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Push,
    PullRequest,
    /// Local invocation from the CLI.
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Push => "push",
            Trigger::PullRequest => "pull_request",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "push" => Ok(Trigger::Push),
            "pull_request" | "pull-request" => Ok(Trigger::PullRequest),
            "manual" => Ok(Trigger::Manual),
            other => Err(format!(
                "unknown trigger '{other}' (expected push, pull_request or manual)"
            )),
        }
    }
}

/// Lifecycle state of a run.
///
/// `Pending -> Running -> {Succeeded, Failed}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Classification of a single executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// Exited zero (or the toolchain was provisioned).
    Succeeded,
    /// Non-zero exit, timeout, spawn failure or provisioning failure.
    Failed,
    /// Failed, but the step is marked `continue_on_error`.
    Tolerated,
}

impl StepOutcome {
    /// Classify a finished step from its exit status.
    pub fn classify(exit_code: Option<i32>, timed_out: bool, continue_on_error: bool) -> Self {
        if exit_code == Some(0) && !timed_out {
            StepOutcome::Succeeded
        } else if continue_on_error {
            StepOutcome::Tolerated
        } else {
            StepOutcome::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Tolerated => "tolerated",
        }
    }
}

/// A toolchain channel plus optional components to make active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSelection {
    /// Channel name, e.g. `stable` or `nightly`.
    pub channel: String,
    /// Extra components, e.g. `rustfmt`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
}

impl ToolchainSelection {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            components: Vec::new(),
        }
    }

    pub fn with_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }
}
