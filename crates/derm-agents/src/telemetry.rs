//! Tracing setup and attempt summaries.

use coordination::{AttemptLog, AttemptOutcome};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(json: bool, default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Counts of attempts by outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptSummary {
    pub total: usize,
    pub succeeded: usize,
    pub transient: usize,
    pub hard: usize,
}

impl AttemptSummary {
    pub fn from_log(log: &AttemptLog) -> Self {
        Self {
            total: log.len(),
            succeeded: log.count(AttemptOutcome::Success),
            transient: log.count(AttemptOutcome::TransientError),
            hard: log.count(AttemptOutcome::HardError),
        }
    }

    /// Emit one `info` line with the counts.
    pub fn log(&self, label: &str) {
        info!(
            label,
            attempts = self.total,
            succeeded = self.succeeded,
            transient_errors = self.transient,
            hard_errors = self.hard,
            "Generation attempts"
        );
    }
}
