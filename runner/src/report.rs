//! Human-facing rendering of run progress and results.
//!
//! Terminal lines are plain strings for the CLI; `summary.md` is rendered
//! through minijinja from `templates/summary.md`.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::pipeline::{Pipeline, Step};
use crate::core::run::{Run, StepRecord};
use crate::core::types::StepOutcome;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md");

#[derive(Debug, Serialize)]
struct StepRow {
    position: usize,
    name: String,
    toolchain: String,
    outcome: &'static str,
    exit: String,
    duration: String,
}

impl StepRow {
    fn from_record(record: &StepRecord) -> Self {
        Self {
            position: record.index + 1,
            name: escape_cell(&record.name),
            toolchain: record.toolchain.clone().unwrap_or_else(|| "-".to_string()),
            outcome: record.outcome.as_str(),
            exit: exit_label(record),
            duration: format_duration(record.duration_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct FailureView {
    step: String,
    reason: String,
    stderr_tail: Option<String>,
}

/// Render `summary.md` for a finished run.
pub fn render_summary(run: &Run, pipeline: &Pipeline) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template("summary", SUMMARY_TEMPLATE)?;

    let rows: Vec<StepRow> = run.steps().iter().map(StepRow::from_record).collect();
    let skipped: Vec<String> = pipeline
        .steps()
        .iter()
        .skip(run.steps().len())
        .map(|step| escape_cell(&step.name))
        .collect();
    let failure = run.failure().map(|failure| FailureView {
        stderr_tail: run
            .steps()
            .get(failure.position - 1)
            .and_then(|record| record.stderr_tail.clone()),
        step: failure.step,
        reason: failure.reason,
    });

    let rendered = env.get_template("summary")?.render(context! {
        pipeline => run.pipeline.as_str(),
        run_id => run.id.as_str(),
        trigger => run.trigger.as_str(),
        status => run.status().to_string(),
        duration => run.duration_ms().map(format_duration),
        failure => failure,
        steps => rows,
        skipped => skipped,
    })?;
    Ok(rendered)
}

/// `==> [2/9] fmt-check: cargo fmt --all -- --check (stable)`
pub fn step_started_line(index: usize, total: usize, step: &Step, toolchain: Option<&str>) -> String {
    let mut line = format!(
        "==> [{}/{}] {}: {}",
        index + 1,
        total,
        step.name,
        step.action.describe()
    );
    if let Some(channel) = toolchain
        && !step.is_toolchain_selection()
    {
        line.push_str(&format!(" ({channel})"));
    }
    line
}

/// `<== [2/9] fmt-check failed (exit code 1) in 0.4s`
pub fn step_finished_line(total: usize, record: &StepRecord) -> String {
    let mut line = format!(
        "<== [{}/{}] {} {}",
        record.index + 1,
        total,
        record.name,
        record.outcome.as_str()
    );
    if record.outcome != StepOutcome::Succeeded {
        line.push_str(&format!(" ({})", failure_reason(record)));
    }
    line.push_str(&format!(" in {}", format_duration(record.duration_ms)));
    line
}

/// Final one-line verdict for a finished run.
pub fn run_result_line(run: &Run, total: usize) -> String {
    let duration = run
        .duration_ms()
        .map(|ms| format!(" in {}", format_duration(ms)))
        .unwrap_or_default();
    match run.failure() {
        None => {
            let tolerated = run
                .steps()
                .iter()
                .filter(|record| record.outcome == StepOutcome::Tolerated)
                .count();
            let mut line = format!(
                "run {} {}: {}/{} steps{}",
                run.id,
                run.status(),
                run.steps().len(),
                total,
                duration
            );
            if tolerated > 0 {
                line.push_str(&format!(" ({tolerated} tolerated failure(s))"));
            }
            line
        }
        Some(failure) => {
            let not_run = total.saturating_sub(run.steps().len());
            format!(
                "run {} {} at step {}/{} '{}': {} ({} not run){}",
                run.id,
                run.status(),
                failure.position,
                total,
                failure.step,
                failure.reason,
                not_run,
                duration
            )
        }
    }
}

/// `850ms`, `12.3s`, `4m 05s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

fn failure_reason(record: &StepRecord) -> String {
    if record.timed_out {
        "timed out".to_string()
    } else if let Some(code) = record.exit_code {
        format!("exit code {code}")
    } else if let Some(err) = &record.error {
        err.clone()
    } else {
        "terminated by signal".to_string()
    }
}

fn exit_label(record: &StepRecord) -> String {
    match (record.exit_code, record.timed_out) {
        (_, true) => "timeout".to_string(),
        (Some(code), false) => code.to_string(),
        (None, false) => "-".to_string(),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ToolchainSelection, Trigger};
    use chrono::{TimeZone, Utc};

    fn record(index: usize, name: &str, outcome: StepOutcome, exit_code: Option<i32>) -> StepRecord {
        StepRecord {
            index,
            name: name.to_string(),
            outcome,
            exit_code,
            timed_out: false,
            duration_ms: 1_500,
            toolchain: Some("stable".to_string()),
            error: None,
            stderr_tail: None,
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            "rust",
            vec![
                Step::select_toolchain("select-stable", ToolchainSelection::new("stable")),
                Step::shell("fmt-check", "cargo fmt --all -- --check"),
                Step::shell("build", "cargo build"),
            ],
        )
    }

    fn failed_run() -> Run {
        let mut run = Run::new("run-1", Trigger::PullRequest, "rust");
        run.begin(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
            .expect("begin");
        run.record_step(record(0, "select-stable", StepOutcome::Succeeded, Some(0)))
            .expect("record");
        let mut fmt = record(1, "fmt-check", StepOutcome::Failed, Some(1));
        fmt.stderr_tail = Some("Diff in src/lib.rs".to_string());
        run.record_step(fmt).expect("record");
        run.finish(Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 5).unwrap())
            .expect("finish");
        run
    }

    #[test]
    fn summary_lists_steps_skips_and_failure() {
        let summary = render_summary(&failed_run(), &pipeline()).expect("render");

        assert!(summary.contains("- Trigger: `pull_request`"));
        assert!(summary.contains("- Status: **failed**"));
        assert!(summary.contains("- Duration: 1m 05s"));
        assert!(summary.contains("- First failing step: `fmt-check` (exit code 1)"));
        assert!(summary.contains("| 2 | fmt-check | stable | failed | 1 | 1.5s |"));
        assert!(summary.contains("## Not run\n\n- build\n"));
        assert!(summary.contains("```text\nDiff in src/lib.rs\n```"));
    }

    #[test]
    fn summary_for_success_has_no_failure_sections() {
        let mut run = Run::new("run-2", Trigger::Push, "rust");
        run.begin(Utc::now()).expect("begin");
        for (index, step) in pipeline().steps().iter().enumerate() {
            run.record_step(record(index, &step.name, StepOutcome::Succeeded, Some(0)))
                .expect("record");
        }
        run.finish(Utc::now()).expect("finish");

        let summary = render_summary(&run, &pipeline()).expect("render");
        assert!(summary.contains("- Status: **succeeded**"));
        assert!(!summary.contains("First failing step"));
        assert!(!summary.contains("## Not run"));
    }

    #[test]
    fn terminal_lines() {
        let step = Step::shell("build", "cargo build");
        assert_eq!(
            step_started_line(2, 9, &step, Some("stable")),
            "==> [3/9] build: cargo build (stable)"
        );

        let mut rec = record(2, "build", StepOutcome::Failed, Some(101));
        rec.duration_ms = 250;
        assert_eq!(
            step_finished_line(9, &rec),
            "<== [3/9] build failed (exit code 101) in 250ms"
        );

        rec.outcome = StepOutcome::Tolerated;
        rec.exit_code = None;
        rec.timed_out = true;
        assert_eq!(
            step_finished_line(9, &rec),
            "<== [3/9] build tolerated (timed out) in 250ms"
        );
    }

    #[test]
    fn result_line_names_failing_step() {
        let line = run_result_line(&failed_run(), 3);
        assert_eq!(
            line,
            "run run-1 failed at step 2/3 'fmt-check': exit code 1 (1 not run) in 1m 05s"
        );
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(850), "850ms");
        assert_eq!(format_duration(12_340), "12.3s");
        assert_eq!(format_duration(245_000), "4m 05s");
    }
}
