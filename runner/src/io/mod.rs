//! I/O helpers for runner commands.

pub mod config;
pub mod executor;
pub mod init;
pub mod pipeline_file;
pub mod process;
pub mod run_log;
pub mod toolchain;
