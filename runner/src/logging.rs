//! Diagnostic tracing for the runner itself.
//!
//! Tracing goes to stderr and is never persisted. It is separate from the
//! run log (`io::run_log`), which records step output and results under
//! `.ci-runner/runs/` regardless of the filter chosen here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by `-v` count.
fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,ci_runner=info",
        _ => "warn,ci_runner=debug",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `verbose` when set:
/// ```bash
/// RUST_LOG=ci_runner::runner=debug ci-runner run
/// ```
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level_only() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "warn,ci_runner=info");
        assert_eq!(default_directive(5), "warn,ci_runner=debug");
    }
}
