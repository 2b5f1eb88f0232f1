//! Fail-fast CI step runner.
//!
//! Reads `ci-runner.toml` from the pipeline root, runs its steps in order
//! and stops at the first failing step. Step output streams to the terminal
//! and, when enabled, into `.ci-runner/runs/<run-id>/`.

use std::path::PathBuf;

use anyhow::Result;
use ci_runner::core::run::{Run, StepFailed};
use ci_runner::core::types::Trigger;
use ci_runner::exit_codes;
use ci_runner::io::executor::SystemExecutor;
use ci_runner::io::init::{InitOptions, init_runner};
use ci_runner::io::toolchain::{PreinstalledProvisioner, RustupProvisioner, ToolchainProvisioner};
use ci_runner::logging;
use ci_runner::report::{run_result_line, step_finished_line, step_started_line};
use ci_runner::runner::{RunEvent, RunOptions, run_pipeline};
use ci_runner::validate::{LoadOptions, Loaded, load_root};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ci-runner",
    version,
    about = "Run CI steps in order, stopping at the first failure"
)]
struct Cli {
    /// Raise diagnostic logging (-v info, -vv debug); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the pipeline.
    Run {
        #[command(flatten)]
        load: LoadArgs,
        /// Event that started this run.
        #[arg(long, default_value = "manual")]
        trigger: Trigger,
    },
    /// Check the pipeline against its schema and invariants.
    Validate {
        #[command(flatten)]
        load: LoadArgs,
    },
    /// Print the steps in execution order.
    List {
        #[command(flatten)]
        load: LoadArgs,
    },
    /// Write a default `ci-runner.toml` and `.ci-runner/config.toml`.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[derive(Args)]
struct LoadArgs {
    /// Pipeline file, relative to the root (default: ci-runner.toml).
    #[arg(long)]
    pipeline: Option<PathBuf>,
    /// Runner config, relative to the root (default: .ci-runner/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pipeline root (default: current directory).
    #[arg(long)]
    root: Option<PathBuf>,
}

impl LoadArgs {
    fn load(&self) -> Result<Loaded> {
        let root = resolve_root(self.root.clone())?;
        load_root(
            &root,
            &LoadOptions {
                pipeline: self.pipeline.clone(),
                config: self.config.clone(),
            },
        )
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => match err.downcast_ref::<StepFailed>() {
            Some(failure) => {
                eprintln!("error: {failure}");
                exit_codes::STEP_FAILED
            }
            None => {
                eprintln!("{:#}", err);
                exit_codes::INVALID
            }
        },
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { load, trigger } => cmd_run(&load, trigger),
        Command::Validate { load } => cmd_validate(&load),
        Command::List { load } => cmd_list(&load),
        Command::Init { force, root } => cmd_init(force, root),
    }
}

fn cmd_run(args: &LoadArgs, trigger: Trigger) -> Result<()> {
    let loaded = args.load()?;
    let executor = SystemExecutor::new(loaded.config.shell.clone())?;
    let options = RunOptions::new(&loaded.paths.root, trigger);

    let run = if loaded.config.toolchain.install {
        let provisioner = RustupProvisioner::new(&executor, loaded.config.toolchain.program.clone());
        execute(&loaded, &executor, &provisioner, &options)?
    } else {
        execute(&loaded, &executor, &PreinstalledProvisioner, &options)?
    };

    eprintln!("{}", run_result_line(&run, loaded.pipeline.len()));
    if loaded.config.run_log.enabled {
        let dir = loaded.paths.resolve(&loaded.config.run_log.dir).join(&run.id);
        eprintln!("run log: {}", dir.display());
    }
    match run.failure() {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

fn execute<P: ToolchainProvisioner>(
    loaded: &Loaded,
    executor: &SystemExecutor,
    provisioner: &P,
    options: &RunOptions,
) -> Result<Run> {
    run_pipeline(
        &loaded.pipeline,
        executor,
        provisioner,
        &loaded.config,
        options,
        |event| match event {
            RunEvent::StepStarted {
                index,
                total,
                step,
                toolchain,
            } => eprintln!("{}", step_started_line(index, total, step, toolchain)),
            RunEvent::StepFinished { total, record } => {
                eprintln!("{}", step_finished_line(total, record));
            }
        },
    )
}

fn cmd_validate(args: &LoadArgs) -> Result<()> {
    let loaded = args.load()?;
    println!(
        "ok: pipeline '{}' ({} steps) in {}",
        loaded.pipeline.name(),
        loaded.pipeline.len(),
        loaded.pipeline_path.display()
    );
    Ok(())
}

fn cmd_list(args: &LoadArgs) -> Result<()> {
    let loaded = args.load()?;
    for (index, step) in loaded.pipeline.steps().iter().enumerate() {
        let mut line = format!("{:>2}. {}: {}", index + 1, step.name, step.action.describe());
        if step.continue_on_error {
            line.push_str(" [continue_on_error]");
        }
        println!("{line}");
    }
    Ok(())
}

fn cmd_init(force: bool, root: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(root)?;
    let paths = init_runner(&root, &InitOptions { force })?;
    println!("wrote {}", paths.pipeline_path.display());
    println!("wrote {}", paths.config_path.display());
    Ok(())
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(std::env::current_dir()?),
    }
}
