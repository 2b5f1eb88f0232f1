//! Execution context threaded from one step to the next.
//!
//! The active toolchain is an explicit field here rather than ambient state.
//! Each step observes the context produced by the step before it; a
//! toolchain selection yields a new context and never edits an earlier one.

use std::collections::BTreeMap;

use crate::core::pipeline::Step;
use crate::core::types::ToolchainSelection;

/// Variable through which the active toolchain reaches child processes.
pub const TOOLCHAIN_ENV: &str = "RUSTUP_TOOLCHAIN";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    toolchain: Option<ToolchainSelection>,
    env: BTreeMap<String, String>,
}

impl ExecContext {
    /// Initial context: pipeline-level env, no toolchain selected.
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self {
            toolchain: None,
            env,
        }
    }

    pub fn toolchain(&self) -> Option<&ToolchainSelection> {
        self.toolchain.as_ref()
    }

    pub fn toolchain_channel(&self) -> Option<&str> {
        self.toolchain.as_ref().map(|t| t.channel.as_str())
    }

    /// Context for the steps after a successful toolchain selection.
    pub fn with_toolchain(&self, selection: ToolchainSelection) -> Self {
        Self {
            toolchain: Some(selection),
            env: self.env.clone(),
        }
    }

    /// Environment for `step`: pipeline env, then the active toolchain, then
    /// the step's own overrides.
    pub fn env_for(&self, step: &Step) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(toolchain) = &self.toolchain {
            env.insert(TOOLCHAIN_ENV.to_string(), toolchain.channel.clone());
        }
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> BTreeMap<String, String> {
        BTreeMap::from([("CARGO_TERM_COLOR".to_string(), "always".to_string())])
    }

    #[test]
    fn no_toolchain_means_no_override() {
        let ctx = ExecContext::new(base_env());
        let env = ctx.env_for(&Step::shell("build", "cargo build"));
        assert_eq!(env.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
        assert!(!env.contains_key(TOOLCHAIN_ENV));
    }

    #[test]
    fn selection_produces_new_context_and_leaves_old_one_alone() {
        let stable = ExecContext::new(base_env()).with_toolchain(ToolchainSelection::new("stable"));
        let nightly = stable.with_toolchain(ToolchainSelection::new("nightly"));

        assert_eq!(stable.toolchain_channel(), Some("stable"));
        assert_eq!(nightly.toolchain_channel(), Some("nightly"));

        let step = Step::shell("test", "cargo test");
        assert_eq!(
            nightly.env_for(&step).get(TOOLCHAIN_ENV).map(String::as_str),
            Some("nightly")
        );
    }

    #[test]
    fn step_env_overrides_pipeline_and_toolchain() {
        let ctx = ExecContext::new(base_env()).with_toolchain(ToolchainSelection::new("stable"));
        let step = Step::shell("fmt", "cargo fmt")
            .with_env(TOOLCHAIN_ENV, "1.80.0")
            .with_env("CARGO_TERM_COLOR", "never");

        let env = ctx.env_for(&step);
        assert_eq!(env.get(TOOLCHAIN_ENV).map(String::as_str), Some("1.80.0"));
        assert_eq!(env.get("CARGO_TERM_COLOR").map(String::as_str), Some("never"));
    }
}
