//! Pipeline file loading (`ci-runner.toml`) with schema + invariant validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_invariants;
use crate::core::pipeline::{Pipeline, Step, StepAction};
use crate::core::types::ToolchainSelection;

pub const PIPELINE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/pipeline/v1.schema.json"
));

/// Pipeline written by `ci-runner init`.
pub const DEFAULT_PIPELINE: &str = include_str!("../templates/pipeline.toml");

#[derive(Debug, Deserialize)]
struct PipelineFile {
    pipeline: PipelineMeta,
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct PipelineMeta {
    name: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    name: String,
    run: Option<String>,
    command: Option<Vec<String>>,
    toolchain: Option<ToolchainSelection>,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
    workdir: Option<PathBuf>,
}

impl StepSpec {
    fn into_step(self) -> Result<Step> {
        let action = match (self.run, self.command, self.toolchain) {
            (Some(run), None, None) => StepAction::Shell { run },
            (None, Some(argv), None) => StepAction::Exec { argv },
            (None, None, Some(selection)) => StepAction::SelectToolchain(selection),
            _ => bail!(
                "step '{}' must set exactly one of run, command or toolchain",
                self.name
            ),
        };
        Ok(Step {
            name: self.name,
            action,
            continue_on_error: self.continue_on_error,
            env: self.env,
            timeout: self.timeout_secs.map(Duration::from_secs),
            workdir: self.workdir,
        })
    }
}

/// Load and validate a pipeline from disk.
pub fn load_pipeline(path: &Path) -> Result<Pipeline> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read pipeline {}", path.display()))?;
    parse_pipeline(&contents).with_context(|| format!("load pipeline {}", path.display()))
}

/// Parse and validate pipeline TOML: schema conformance, then invariants.
pub fn parse_pipeline(contents: &str) -> Result<Pipeline> {
    let table: toml::Table = toml::from_str(contents).context("parse pipeline toml")?;
    let value = serde_json::to_value(&table).context("convert pipeline to json")?;
    validate_schema(&value)?;

    let file: PipelineFile =
        serde_json::from_value(value).context("deserialize pipeline")?;
    let steps = file
        .steps
        .into_iter()
        .map(StepSpec::into_step)
        .collect::<Result<Vec<_>>>()?;
    let pipeline = Pipeline::new(file.pipeline.name, steps).with_env(file.pipeline.env);

    let errors = validate_invariants(&pipeline);
    if !errors.is_empty() {
        return Err(anyhow!(
            "pipeline invariants failed:\n- {}",
            errors.join("\n- ")
        ));
    }
    debug!(pipeline = %pipeline.name(), steps = pipeline.len(), "pipeline loaded");
    Ok(pipeline)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PIPELINE_SCHEMA).context("parse pipeline schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "pipeline schema validation failed:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}
