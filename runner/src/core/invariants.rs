//! Semantic invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, HashSet};
use std::path::Component;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::core::pipeline::{Pipeline, Step, StepAction};

static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Check pipeline invariants:
/// - At least one step
/// - Step names non-empty, single-line, unique
/// - Commands non-empty
/// - Toolchain channels and components well-formed
/// - Environment variable names valid
/// - Timeouts non-zero
pub fn validate_invariants(pipeline: &Pipeline) -> Vec<String> {
    let mut errors = Vec::new();

    if pipeline.name().trim().is_empty() {
        errors.push("pipeline name must be non-empty".to_string());
    }
    if pipeline.is_empty() {
        errors.push("pipeline must declare at least one step".to_string());
    }
    validate_env("pipeline", pipeline.env(), &mut errors);

    let mut seen = HashSet::new();
    for (index, step) in pipeline.steps().iter().enumerate() {
        let label = format!("steps[{index}]");
        if !step.name.trim().is_empty() && !seen.insert(step.name.as_str()) {
            errors.push(format!("{label}: duplicate step name '{}'", step.name));
        }
        validate_step(&label, step, &mut errors);
    }
    errors
}

fn validate_step(label: &str, step: &Step, errors: &mut Vec<String>) {
    if step.name.trim().is_empty() {
        errors.push(format!("{label}: name must be non-empty"));
    } else if step.name.chars().any(char::is_control) {
        errors.push(format!("{label}: name must not contain control characters"));
    }

    match &step.action {
        StepAction::Shell { run } => {
            if run.trim().is_empty() {
                errors.push(format!("{label}: run must be non-empty"));
            }
        }
        StepAction::Exec { argv } => {
            if argv.first().is_none_or(|program| program.trim().is_empty()) {
                errors.push(format!("{label}: command must be a non-empty array"));
            }
        }
        StepAction::SelectToolchain(selection) => {
            if !CHANNEL_RE.is_match(&selection.channel) {
                errors.push(format!(
                    "{label}: invalid toolchain channel '{}'",
                    selection.channel
                ));
            }
            if selection.components.iter().any(|c| c.trim().is_empty()) {
                errors.push(format!("{label}: toolchain components must be non-empty"));
            }
        }
    }

    if step.timeout == Some(Duration::ZERO) {
        errors.push(format!("{label}: timeout_secs must be > 0"));
    }
    if let Some(workdir) = &step.workdir
        && (workdir.is_absolute()
            || workdir
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_))))
    {
        errors.push(format!(
            "{label}: workdir must stay inside the pipeline root (no absolute path or '..')"
        ));
    }
    validate_env(label, &step.env, errors);
}

fn validate_env(label: &str, env: &BTreeMap<String, String>, errors: &mut Vec<String>) {
    for key in env.keys() {
        if !ENV_NAME_RE.is_match(key) {
            errors.push(format!("{label}: invalid env name '{key}'"));
        }
    }
}
