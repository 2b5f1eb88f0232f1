//! Run record and its lifecycle.
//!
//! A [`Run`] moves `pending -> running -> {succeeded, failed}` and rejects
//! every mutation once terminal. Recording a failed step is what makes a run
//! terminal, so no step can be recorded after the first failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{RunStatus, StepOutcome, Trigger};

/// What happened to one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based position in the pipeline.
    pub index: usize,
    pub name: String,
    pub outcome: StepOutcome,
    /// `None` when the process was killed, timed out or never spawned.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Toolchain channel in effect for this step.
    pub toolchain: Option<String>,
    /// Runner-side reason when there is no exit code to show.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last lines of stderr, kept only for steps that did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

/// The run failed at `step`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step {position} '{step}' failed: {reason}")]
pub struct StepFailed {
    pub step: String,
    /// One-based position, for operators.
    pub position: usize,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub reason: String,
}

impl StepFailed {
    fn from_record(record: &StepRecord) -> Self {
        let reason = if record.timed_out {
            "timed out".to_string()
        } else if let Some(code) = record.exit_code {
            format!("exit code {code}")
        } else if let Some(err) = &record.error {
            err.clone()
        } else {
            "terminated by signal".to_string()
        };
        Self {
            step: record.name.clone(),
            position: record.index + 1,
            exit_code: record.exit_code,
            timed_out: record.timed_out,
            reason,
        }
    }
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run {run_id} cannot {action} while {status}")]
    InvalidState {
        run_id: String,
        action: &'static str,
        status: RunStatus,
    },
    #[error("run {run_id} already finished")]
    AlreadyFinished { run_id: String },
}

/// One end-to-end execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub trigger: Trigger,
    pub pipeline: String,
    status: RunStatus,
    steps: Vec<StepRecord>,
    first_failing_step: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: impl Into<String>, trigger: Trigger, pipeline: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger,
            pipeline: pipeline.into(),
            status: RunStatus::Pending,
            steps: Vec::new(),
            first_failing_step: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn first_failing_step(&self) -> Option<&str> {
        self.first_failing_step.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Wall-clock duration once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some(
            (finished - started)
                .num_milliseconds()
                .try_into()
                .unwrap_or(0),
        )
    }

    /// The failure that ended the run, if it failed.
    pub fn failure(&self) -> Option<StepFailed> {
        let name = self.first_failing_step.as_deref()?;
        self.steps
            .iter()
            .find(|record| record.outcome == StepOutcome::Failed && record.name == name)
            .map(StepFailed::from_record)
    }

    /// `pending -> running`.
    pub fn begin(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != RunStatus::Pending {
            return Err(self.invalid("begin"));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    /// Append a step record. A failed record makes the run terminal.
    pub fn record_step(&mut self, record: StepRecord) -> Result<(), TransitionError> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("record a step"));
        }
        if record.outcome == StepOutcome::Failed {
            self.status = RunStatus::Failed;
            self.first_failing_step = Some(record.name.clone());
        }
        self.steps.push(record);
        Ok(())
    }

    /// Close the run. A run still `running` here had no failing step.
    pub fn finish(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.finished_at.is_some() {
            return Err(TransitionError::AlreadyFinished {
                run_id: self.id.clone(),
            });
        }
        match self.status {
            RunStatus::Running => self.status = RunStatus::Succeeded,
            RunStatus::Failed => {}
            _ => return Err(self.invalid("finish")),
        }
        self.finished_at = Some(at);
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::InvalidState {
            run_id: self.id.clone(),
            action,
            status: self.status,
        }
    }
}
