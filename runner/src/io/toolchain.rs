//! Toolchain provisioning for `toolchain` steps.
//!
//! Provisioning makes a channel available; the runner then carries the
//! selection forward in its execution context. A provisioner failure fails the
//! enclosing step like any other command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::types::ToolchainSelection;
use crate::io::executor::{ExecOutcome, ExecRequest, Invocation, ProcessExecutor};
use crate::io::process::StreamOptions;

/// Parameters for one provisioning call.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Step name, for logs.
    pub step: String,
    pub selection: ToolchainSelection,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
    pub stream: StreamOptions,
}

pub trait ToolchainProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ExecOutcome>;
}

/// Installs channels with `rustup toolchain install`.
pub struct RustupProvisioner<'a, E: ProcessExecutor> {
    executor: &'a E,
    program: String,
}

impl<'a, E: ProcessExecutor> RustupProvisioner<'a, E> {
    pub fn new(executor: &'a E, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
        }
    }

    /// `rustup toolchain install <channel> --profile minimal [-c <component>]...`
    pub fn install_argv(&self, selection: &ToolchainSelection) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "toolchain".to_string(),
            "install".to_string(),
            selection.channel.clone(),
            "--profile".to_string(),
            "minimal".to_string(),
            "--no-self-update".to_string(),
        ];
        for component in &selection.components {
            argv.push("--component".to_string());
            argv.push(component.clone());
        }
        argv
    }
}

impl<E: ProcessExecutor> ToolchainProvisioner for RustupProvisioner<'_, E> {
    #[instrument(skip_all, fields(step = %request.step, channel = %request.selection.channel))]
    fn provision(&self, request: &ProvisionRequest) -> Result<ExecOutcome> {
        info!("installing toolchain");
        self.executor.exec(&ExecRequest {
            step: request.step.clone(),
            invocation: Invocation::Argv(self.install_argv(&request.selection)),
            workdir: request.workdir.clone(),
            env: request.env.clone(),
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
            stream: request.stream.clone(),
        })
    }
}

/// Accepts every selection without installing anything.
///
/// For hosts where toolchains are preinstalled; later steps still see the
/// selection through `RUSTUP_TOOLCHAIN`.
pub struct PreinstalledProvisioner;

impl ToolchainProvisioner for PreinstalledProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ExecOutcome> {
        debug!(channel = %request.selection.channel, "assuming toolchain is preinstalled");
        Ok(ExecOutcome::exited(0))
    }
}
