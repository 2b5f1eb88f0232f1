//! Declarative pipeline model: an ordered, immutable list of steps.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::core::types::ToolchainSelection;

/// What a step does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// A command line handed to the configured shell verbatim.
    Shell { run: String },
    /// A program plus arguments, spawned without a shell.
    Exec { argv: Vec<String> },
    /// Make a toolchain active for every later step.
    SelectToolchain(ToolchainSelection),
}

impl StepAction {
    /// One-line rendering used by `list` and the run summary.
    pub fn describe(&self) -> String {
        match self {
            StepAction::Shell { run } => run.lines().next().unwrap_or_default().to_string(),
            StepAction::Exec { argv } => render_argv(argv),
            StepAction::SelectToolchain(selection) => {
                if selection.components.is_empty() {
                    format!("toolchain {}", selection.channel)
                } else {
                    format!(
                        "toolchain {} (+{})",
                        selection.channel,
                        selection.components.join(", ")
                    )
                }
            }
        }
    }
}

/// One entry of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    /// A failure is recorded but does not stop the run.
    pub continue_on_error: bool,
    /// Variables applied to this step only (override pipeline env).
    pub env: BTreeMap<String, String>,
    /// Overrides the configured default step timeout.
    pub timeout: Option<Duration>,
    /// Working directory relative to the pipeline root.
    pub workdir: Option<PathBuf>,
}

impl Step {
    fn with_action(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            continue_on_error: false,
            env: BTreeMap::new(),
            timeout: None,
            workdir: None,
        }
    }

    pub fn shell(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self::with_action(name, StepAction::Shell { run: run.into() })
    }

    pub fn exec<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_action(
            name,
            StepAction::Exec {
                argv: argv.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn select_toolchain(name: impl Into<String>, selection: ToolchainSelection) -> Self {
        Self::with_action(name, StepAction::SelectToolchain(selection))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn is_toolchain_selection(&self) -> bool {
        matches!(self.action, StepAction::SelectToolchain(_))
    }
}

/// Ordered step sequence, fixed once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    name: String,
    env: BTreeMap<String, String>,
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            env: BTreeMap::new(),
            steps,
        }
    }

    /// Variables applied to every step.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Render an argv as a copy-pasteable shell line.
pub fn render_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_escape(input: &str) -> String {
    if !input.is_empty()
        && input
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return input.to_string();
    }
    let mut escaped = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_quotes_exec_arguments() {
        let step = Step::exec("upload", ["bash", "-c", "curl -s https://example.com | bash"]);
        assert_eq!(
            step.action.describe(),
            "bash -c 'curl -s https://example.com | bash'"
        );
    }

    #[test]
    fn describe_shows_first_line_of_shell_script() {
        let step = Step::shell("build", "cargo build --verbose\ncargo doc");
        assert_eq!(step.action.describe(), "cargo build --verbose");
    }

    #[test]
    fn describe_lists_toolchain_components() {
        let step = Step::select_toolchain(
            "nightly",
            ToolchainSelection::new("nightly").with_components(["rustfmt", "clippy"]),
        );
        assert_eq!(step.action.describe(), "toolchain nightly (+rustfmt, clippy)");
    }

    #[test]
    fn pipeline_preserves_declaration_order() {
        let pipeline = Pipeline::new(
            "ci",
            vec![Step::shell("b", "true"), Step::shell("a", "true")],
        );
        let names: Vec<&str> = pipeline.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn escape_handles_single_quotes() {
        assert_eq!(shell_escape("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_escape(""), "''");
    }
}
