//! Fail-fast execution of a pipeline.
//!
//! Steps run strictly in declaration order, one at a time. Each step gets the
//! [`ExecContext`] left by the step before it. The first failing step ends the
//! run; later steps are never invoked.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::core::context::ExecContext;
use crate::core::pipeline::{Pipeline, Step, StepAction};
use crate::core::run::{Run, StepRecord};
use crate::core::types::{StepOutcome, Trigger};
use crate::io::config::RunnerConfig;
use crate::io::executor::{ExecOutcome, ExecRequest, Invocation, ProcessExecutor};
use crate::io::init::RunnerPaths;
use crate::io::process::{SpawnError, StreamOptions, TAIL_LINES};
use crate::io::run_log::{RunLogPaths, write_run, write_summary};
use crate::io::toolchain::{ProvisionRequest, ToolchainProvisioner};
use crate::report::render_summary;

/// Per-invocation options for [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pipeline root: default working directory and base for run logs.
    pub root: PathBuf,
    pub trigger: Trigger,
    /// Explicit run id; generated from the clock when `None`.
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new(root: impl Into<PathBuf>, trigger: Trigger) -> Self {
        Self {
            root: root.into(),
            trigger,
            run_id: None,
        }
    }
}

/// Progress notifications, delivered in execution order.
#[derive(Debug)]
pub enum RunEvent<'a> {
    StepStarted {
        index: usize,
        total: usize,
        step: &'a Step,
        /// Toolchain the step will observe.
        toolchain: Option<&'a str>,
    },
    StepFinished {
        total: usize,
        record: &'a StepRecord,
    },
}

struct Attempt {
    exit_code: Option<i32>,
    timed_out: bool,
    error: Option<String>,
    stderr: String,
}

impl Attempt {
    fn from_outcome(outcome: ExecOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            error: None,
            stderr: outcome.stderr,
        }
    }
}

/// Execute `pipeline` once and return the finished run.
///
/// A failing step is not an `Err`: it is reported through the returned
/// [`Run`] (`status = failed`, `first_failing_step`). `Err` means the runner
/// itself could not continue (run log unwritable, executor fault).
#[instrument(skip_all, fields(pipeline = %pipeline.name(), trigger = %options.trigger))]
pub fn run_pipeline<E, P, F>(
    pipeline: &Pipeline,
    executor: &E,
    provisioner: &P,
    config: &RunnerConfig,
    options: &RunOptions,
    mut on_event: F,
) -> Result<Run>
where
    E: ProcessExecutor,
    P: ToolchainProvisioner,
    F: FnMut(RunEvent<'_>),
{
    let paths = RunnerPaths::new(&options.root);
    let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
    let log = if config.run_log.enabled {
        let log = RunLogPaths::new(&paths.resolve(&config.run_log.dir), &run_id);
        log.create()?;
        Some(log)
    } else {
        None
    };

    let mut run = Run::new(&run_id, options.trigger, pipeline.name());
    run.begin(Utc::now())?;
    info!(run_id = %run_id, steps = pipeline.len(), "run started");

    let total = pipeline.len();
    let mut ctx = ExecContext::new(pipeline.env().clone());
    for (index, step) in pipeline.steps().iter().enumerate() {
        on_event(RunEvent::StepStarted {
            index,
            total,
            step,
            toolchain: ctx.toolchain_channel(),
        });

        let started = Instant::now();
        let attempted = attempt_step(
            index,
            step,
            &ctx,
            executor,
            provisioner,
            config,
            &paths,
            log.as_ref(),
        );
        let attempt = match attempted {
            Ok(attempt) => attempt,
            Err(err) => {
                if let Some(log) = &log {
                    write_run(log, &run)?;
                    let path = log.dir.join("runner_error.log");
                    fs::write(&path, format!("runner error: {err:#}\n"))
                        .with_context(|| format!("write {}", path.display()))?;
                }
                return Err(err);
            }
        };

        let outcome =
            StepOutcome::classify(attempt.exit_code, attempt.timed_out, step.continue_on_error);
        let toolchain = match &step.action {
            StepAction::SelectToolchain(selection) => Some(selection.channel.clone()),
            _ => ctx.toolchain_channel().map(str::to_string),
        };
        if outcome == StepOutcome::Succeeded
            && let StepAction::SelectToolchain(selection) = &step.action
        {
            ctx = ctx.with_toolchain(selection.clone());
            debug!(channel = %selection.channel, "toolchain selected");
        }

        let record = StepRecord {
            index,
            name: step.name.clone(),
            outcome,
            exit_code: attempt.exit_code,
            timed_out: attempt.timed_out,
            duration_ms: duration_ms(started.elapsed()),
            toolchain,
            error: attempt.error,
            stderr_tail: (outcome != StepOutcome::Succeeded)
                .then(|| tail_lines(&attempt.stderr, TAIL_LINES))
                .filter(|tail| !tail.is_empty()),
        };
        run.record_step(record)?;
        if let Some(record) = run.steps().last() {
            on_event(RunEvent::StepFinished { total, record });
        }

        match outcome {
            StepOutcome::Succeeded => debug!(step = %step.name, "step succeeded"),
            StepOutcome::Tolerated => {
                warn!(step = %step.name, exit_code = ?attempt.exit_code, "step failed, continuing");
            }
            StepOutcome::Failed => {
                warn!(
                    step = %step.name,
                    exit_code = ?attempt.exit_code,
                    skipped = total - index - 1,
                    "step failed, stopping run"
                );
                break;
            }
        }
    }

    run.finish(Utc::now())?;
    info!(run_id = %run_id, status = %run.status(), "run finished");

    if let Some(log) = &log {
        write_run(log, &run)?;
        let summary = render_summary(&run, pipeline).context("render run summary")?;
        write_summary(log, &summary)?;
    }
    Ok(run)
}

#[allow(clippy::too_many_arguments)]
fn attempt_step<E: ProcessExecutor, P: ToolchainProvisioner>(
    index: usize,
    step: &Step,
    ctx: &ExecContext,
    executor: &E,
    provisioner: &P,
    config: &RunnerConfig,
    paths: &RunnerPaths,
    log: Option<&RunLogPaths>,
) -> Result<Attempt> {
    let workdir = match &step.workdir {
        Some(dir) => paths.root.join(dir),
        None => paths.root.clone(),
    };
    let env = ctx.env_for(step);
    let timeout = Some(step.timeout.unwrap_or_else(|| config.step_timeout()));
    let stream = StreamOptions {
        echo: config.stream_output,
        log_path: log.map(|log| log.step_log_path(index, &step.name)),
    };

    let invocation = match &step.action {
        StepAction::Shell { run } => Invocation::Shell(run.clone()),
        StepAction::Exec { argv } => Invocation::Argv(argv.clone()),
        StepAction::SelectToolchain(selection) => {
            let result = provisioner.provision(&ProvisionRequest {
                step: step.name.clone(),
                selection: selection.clone(),
                workdir,
                env,
                timeout,
                output_limit_bytes: config.output_limit_bytes,
                stream,
            });
            return settle(step, result);
        }
    };
    let result = executor.exec(&ExecRequest {
        step: step.name.clone(),
        invocation,
        workdir,
        env,
        timeout,
        output_limit_bytes: config.output_limit_bytes,
        stream,
    });
    settle(step, result)
}

/// A spawn failure is the step's failure; any other error is the runner's.
fn settle(step: &Step, result: Result<ExecOutcome>) -> Result<Attempt> {
    match result {
        Ok(outcome) => Ok(Attempt::from_outcome(outcome)),
        Err(err) => match err.downcast_ref::<SpawnError>() {
            Some(spawn) => {
                warn!(step = %step.name, err = %spawn, "step could not be started");
                Ok(Attempt {
                    exit_code: None,
                    timed_out: false,
                    error: Some(spawn.to_string()),
                    stderr: String::new(),
                })
            }
            None => Err(err.context(format!("step '{}'", step.name))),
        },
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// `20261018_142501-k3x9qa`: sortable timestamp plus a short random suffix.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use crate::test_support::{ScriptedExecutor, ScriptedProvisioner, TestWorkspace, quiet_config};

    fn options(workspace: &TestWorkspace) -> RunOptions {
        RunOptions {
            root: workspace.path().to_path_buf(),
            trigger: Trigger::Push,
            run_id: Some("run-test".to_string()),
        }
    }

    #[test]
    fn run_id_has_timestamp_and_suffix() {
        let id = generate_run_id();
        let (stamp, suffix) = id.rsplit_once('-').expect("suffix");
        assert_eq!(stamp.len(), "20261018_142501".len());
        assert_eq!(suffix.len(), 6);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("", 2), "");
    }

    #[test]
    fn executor_fault_aborts_and_keeps_partial_run_log() {
        let workspace = TestWorkspace::new().expect("workspace");
        let pipeline = Pipeline::new(
            "ci",
            vec![
                Step::shell("build", "cargo build"),
                Step::shell("test", "cargo test"),
                Step::shell("clippy", "cargo clippy"),
            ],
        );
        let executor = ScriptedExecutor::new().runner_error("test", "executor crashed");

        let err = run_pipeline(
            &pipeline,
            &executor,
            &ScriptedProvisioner::new(),
            &quiet_config(),
            &options(&workspace),
            |_| {},
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("executor crashed"));
        assert_eq!(executor.invoked_steps(), vec!["build", "test"]);
        let dir = workspace.path().join(".ci-runner/runs/run-test");
        assert!(dir.join("runner_error.log").is_file());

        let partial: Run = serde_json::from_str(
            &fs::read_to_string(dir.join("run.json")).expect("run.json"),
        )
        .expect("parse run.json");
        assert_eq!(partial.status(), RunStatus::Running);
        let recorded: Vec<&str> = partial.steps().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(recorded, vec!["build"]);
        assert!(partial.finished_at().is_none());
    }

    #[test]
    fn events_arrive_in_order() {
        let workspace = TestWorkspace::new().expect("workspace");
        let pipeline = Pipeline::new(
            "ci",
            vec![Step::shell("a", "true"), Step::shell("b", "false")],
        );
        let executor = ScriptedExecutor::new().exit("b", 1);
        let mut events = Vec::new();

        let run = run_pipeline(
            &pipeline,
            &executor,
            &ScriptedProvisioner::new(),
            &quiet_config(),
            &options(&workspace),
            |event| {
                events.push(match event {
                    RunEvent::StepStarted { step, .. } => format!("start {}", step.name),
                    RunEvent::StepFinished { record, .. } => {
                        format!("finish {} {}", record.name, record.outcome.as_str())
                    }
                });
            },
        )
        .expect("run");

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            events,
            vec!["start a", "finish a succeeded", "start b", "finish b failed"]
        );
    }

    #[test]
    fn default_timeout_applies_unless_step_overrides() {
        let workspace = TestWorkspace::new().expect("workspace");
        let pipeline = Pipeline::new(
            "ci",
            vec![
                Step::shell("default", "true"),
                Step::shell("custom", "true").with_timeout(Duration::from_secs(5)),
            ],
        );
        let executor = ScriptedExecutor::new();
        let mut cfg = quiet_config();
        cfg.step_timeout_secs = 60;

        run_pipeline(
            &pipeline,
            &executor,
            &ScriptedProvisioner::new(),
            &cfg,
            &options(&workspace),
            |_| {},
        )
        .expect("run");

        let timeouts: Vec<Option<Duration>> =
            executor.calls().iter().map(|c| c.timeout).collect();
        assert_eq!(
            timeouts,
            vec![Some(Duration::from_secs(60)), Some(Duration::from_secs(5))]
        );
    }

    #[test]
    fn workdir_is_resolved_against_root() {
        let workspace = TestWorkspace::new().expect("workspace");
        let pipeline = Pipeline::new(
            "ci",
            vec![Step::shell("sub", "true").with_workdir("crates/core")],
        );
        let executor = ScriptedExecutor::new();

        run_pipeline(
            &pipeline,
            &executor,
            &ScriptedProvisioner::new(),
            &quiet_config(),
            &options(&workspace),
            |_| {},
        )
        .expect("run");

        assert_eq!(
            executor.calls()[0].workdir,
            workspace.path().join("crates/core")
        );
    }
}
