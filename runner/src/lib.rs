//! Fail-fast CI step orchestration.
//!
//! A pipeline is an ordered list of steps (shell commands, argv commands and
//! toolchain selections). The runner executes them one at a time and stops at
//! the first failure. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (pipeline model, execution
//!   context, run lifecycle, invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, toolchain
//!   provisioning, config and run log files). Behind traits where tests need
//!   to script outcomes.
//!
//! Orchestration modules ([`runner`], [`validate`], [`report`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
