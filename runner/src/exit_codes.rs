//! Stable exit codes for ci-runner commands.

/// Command succeeded; for `run`, every step succeeded.
pub const OK: i32 = 0;
/// `ci-runner run` stopped at a failing step.
pub const STEP_FAILED: i32 = 1;
/// Invalid pipeline/config or another runner error.
pub const INVALID: i32 = 2;
